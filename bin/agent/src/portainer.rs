//! Client for a Portainer-compatible orchestrator API: session
//! auth with transparent refresh, endpoint discovery, and stack
//! create / update / verify over stack file content.

use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{config::PortainerConfig, error::CycleError};

const STACK_STATUS_ACTIVE: i64 = 1;
/// Swarm stack type for the create endpoint.
const STACK_TYPE_SWARM: i64 = 1;
const VERIFY_DEADLINE: Duration = Duration::from_secs(60);
const VERIFY_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct PortainerClient {
  base: String,
  username: String,
  password: String,
  stack_name: String,
  /// Negative means: discover the single endpoint.
  configured_endpoint_id: i64,
  http: reqwest::Client,
  /// Bearer token, cached for the client lifetime and refreshed
  /// once on a 401.
  token: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct AuthResponse {
  jwt: String,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
  #[serde(rename = "Id")]
  id: i64,
}

#[derive(Debug, Deserialize)]
struct SwarmInfo {
  #[serde(rename = "ID")]
  id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortainerStack {
  #[serde(rename = "Id")]
  pub id: i64,
  #[serde(rename = "Name")]
  pub name: String,
  #[serde(rename = "Status", default)]
  pub status: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
  Deployed { created: bool },
  /// Remote stack already runs this exact descriptor.
  Noop,
}

impl PortainerClient {
  pub fn new(
    config: &PortainerConfig,
    timeout: Duration,
  ) -> anyhow::Result<PortainerClient> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .context("Failed to build portainer http client")?;
    Ok(PortainerClient {
      base: config.url.trim_end_matches('/').to_string(),
      username: config.username.clone(),
      password: config.password.clone(),
      stack_name: config.stack_name.clone(),
      configured_endpoint_id: config.endpoint_id,
      http,
      token: Mutex::new(None),
    })
  }

  pub fn stack_name(&self) -> &str {
    &self.stack_name
  }

  async fn authenticate(&self) -> Result<String, CycleError> {
    let response = self
      .http
      .post(format!("{}/api/auth", self.base))
      .json(&serde_json::json!({
        "Username": self.username,
        "Password": self.password,
      }))
      .send()
      .await
      .map_err(|e| {
        CycleError::transient(
          anyhow!(e).context("Auth request failed"),
        )
      })?;
    let response = classified(response, "Authentication").await?;
    let AuthResponse { jwt } =
      response.json().await.map_err(|e| {
        CycleError::transient(
          anyhow!(e).context("Invalid auth response"),
        )
      })?;
    Ok(jwt)
  }

  /// Sends a request with the cached bearer token, transparently
  /// re-authenticating once on a 401.
  async fn send<F>(
    &self,
    stage: &str,
    build: F,
  ) -> Result<reqwest::Response, CycleError>
  where
    F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
  {
    let token = {
      let mut token = self.token.lock().await;
      match token.as_ref() {
        Some(token) => token.clone(),
        None => {
          let fresh = self.authenticate().await?;
          *token = Some(fresh.clone());
          fresh
        }
      }
    };

    let response = build(&self.http, &self.base)
      .bearer_auth(&token)
      .send()
      .await
      .map_err(|e| {
        CycleError::transient(
          anyhow!(e).context(format!("{stage} request failed")),
        )
      })?;

    if response.status() != reqwest::StatusCode::UNAUTHORIZED {
      return classified(response, stage).await;
    }

    let fresh = self.authenticate().await?;
    *self.token.lock().await = Some(fresh.clone());
    let response = build(&self.http, &self.base)
      .bearer_auth(&fresh)
      .send()
      .await
      .map_err(|e| {
        CycleError::transient(
          anyhow!(e).context(format!("{stage} request failed")),
        )
      })?;
    classified(response, stage).await
  }

  async fn resolve_endpoint(&self) -> Result<i64, CycleError> {
    if self.configured_endpoint_id >= 0 {
      return Ok(self.configured_endpoint_id);
    }
    let endpoints: Vec<Endpoint> = self
      .send("List endpoints", |http, base| {
        http.get(format!("{base}/api/endpoints"))
      })
      .await?
      .json()
      .await
      .map_err(|e| {
        CycleError::transient(
          anyhow!(e).context("Invalid endpoints response"),
        )
      })?;
    match endpoints.as_slice() {
      [endpoint] => Ok(endpoint.id),
      [] => Err(CycleError::OrchestratorRejected(anyhow!(
        "No endpoints available for discovery"
      ))),
      _ => Err(CycleError::OrchestratorRejected(anyhow!(
        "Endpoint discovery found {} endpoints, configure endpoint_id explicitly",
        endpoints.len()
      ))),
    }
  }

  async fn swarm_id(
    &self,
    endpoint_id: i64,
  ) -> Result<String, CycleError> {
    let swarm: SwarmInfo = self
      .send("Get swarm", |http, base| {
        http.get(format!(
          "{base}/api/endpoints/{endpoint_id}/docker/swarm"
        ))
      })
      .await?
      .json()
      .await
      .map_err(|e| {
        CycleError::transient(
          anyhow!(e).context("Invalid swarm response"),
        )
      })?;
    Ok(swarm.id)
  }

  async fn find_stack(
    &self,
    swarm_id: &str,
  ) -> Result<Option<PortainerStack>, CycleError> {
    let filters =
      serde_json::json!({ "SwarmID": swarm_id }).to_string();
    let stacks: Vec<PortainerStack> = self
      .send("List stacks", |http, base| {
        http
          .get(format!("{base}/api/stacks"))
          .query(&[("filters", filters.as_str())])
      })
      .await?
      .json()
      .await
      .map_err(|e| {
        CycleError::transient(
          anyhow!(e).context("Invalid stacks response"),
        )
      })?;
    Ok(
      stacks
        .into_iter()
        .find(|stack| stack.name == self.stack_name),
    )
  }

  async fn get_stack(
    &self,
    stack_id: i64,
  ) -> Result<PortainerStack, CycleError> {
    self
      .send("Get stack", |http, base| {
        http.get(format!("{base}/api/stacks/{stack_id}"))
      })
      .await?
      .json()
      .await
      .map_err(|e| {
        CycleError::transient(
          anyhow!(e).context("Invalid stack response"),
        )
      })
  }

  /// Pushes the descriptor: create when the named stack does not
  /// exist, update otherwise, then poll until the stack reports
  /// active. An unchanged digest against an active remote stack
  /// is a no-op and skips the orchestrator entirely.
  pub async fn deploy(
    &self,
    stack_file_content: &str,
    digest: &str,
    last_digest: Option<&str>,
    cancel: &CancellationToken,
  ) -> Result<DeployOutcome, CycleError> {
    ensure_live(cancel)?;
    let endpoint_id = self.resolve_endpoint().await?;
    ensure_live(cancel)?;
    let swarm_id = self.swarm_id(endpoint_id).await?;
    ensure_live(cancel)?;
    let existing = self.find_stack(&swarm_id).await?;
    ensure_live(cancel)?;

    let (stack_id, created) = match existing {
      Some(stack)
        if last_digest == Some(digest)
          && stack.status == STACK_STATUS_ACTIVE =>
      {
        debug!(
          "Stack '{}' already runs descriptor {digest}, nothing to do",
          self.stack_name
        );
        return Ok(DeployOutcome::Noop);
      }
      Some(stack) => {
        self
          .send("Update stack", |http, base| {
            http
              .put(format!("{base}/api/stacks/{}", stack.id))
              .query(&[("endpointId", endpoint_id)])
              .json(&serde_json::json!({
                "StackFileContent": stack_file_content,
                "Env": [],
                "Prune": true,
              }))
          })
          .await?;
        (stack.id, false)
      }
      None => {
        let created: PortainerStack = self
          .send("Create stack", |http, base| {
            http
              .post(format!("{base}/api/stacks"))
              .query(&[
                ("type", STACK_TYPE_SWARM.to_string()),
                ("method", String::from("string")),
                ("endpointId", endpoint_id.to_string()),
              ])
              .json(&serde_json::json!({
                "Name": self.stack_name,
                "SwarmID": swarm_id,
                "StackFileContent": stack_file_content,
              }))
          })
          .await?
          .json()
          .await
          .map_err(|e| {
            CycleError::transient(
              anyhow!(e).context("Invalid create stack response"),
            )
          })?;
        (created.id, true)
      }
    };

    self.verify(stack_id, cancel).await?;
    Ok(DeployOutcome::Deployed { created })
  }

  /// Polls the stack until it reports active or the deadline
  /// elapses.
  async fn verify(
    &self,
    stack_id: i64,
    cancel: &CancellationToken,
  ) -> Result<(), CycleError> {
    let deadline = Instant::now() + VERIFY_DEADLINE;
    loop {
      ensure_live(cancel)?;
      let stack = self.get_stack(stack_id).await?;
      if stack.status == STACK_STATUS_ACTIVE {
        return Ok(());
      }
      if Instant::now() >= deadline {
        return Err(CycleError::transient(anyhow!(
          "Stack '{}' not active after {}s",
          self.stack_name,
          VERIFY_DEADLINE.as_secs(),
        )));
      }
      tokio::select! {
        _ = tokio::time::sleep(VERIFY_POLL_INTERVAL) => {}
        _ = cancel.cancelled() => return Err(CycleError::Cancelled),
      }
    }
  }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), CycleError> {
  if cancel.is_cancelled() {
    Err(CycleError::Cancelled)
  } else {
    Ok(())
  }
}

/// 4xx is a rejection, everything else unsuccessful is transient.
async fn classified(
  response: reqwest::Response,
  stage: &str,
) -> Result<reqwest::Response, CycleError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  let err = anyhow!("{stage} returned {status} | {body}");
  if status.is_client_error() {
    Err(CycleError::OrchestratorRejected(err))
  } else {
    Err(CycleError::transient(err))
  }
}
