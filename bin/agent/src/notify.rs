//! Post-deploy chat notifications. Best-effort: every target is
//! attempted, failures are logged, nothing here can fail a cycle.

use std::{sync::OnceLock, time::Duration};

use anyhow::{Context, anyhow};
use futures::future::join_all;

use crate::config::{NotificationConfig, NotificationService};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[instrument(level = "debug", skip(notifications))]
pub async fn notify_deployed(
  notifications: &[NotificationConfig],
  version: &str,
) {
  if notifications.is_empty() {
    return;
  }
  let handles = notifications
    .iter()
    .map(|notification| send_notification(notification, version));
  join_all(handles)
    .await
    .into_iter()
    .filter_map(|res| res.err())
    .for_each(|e| error!("{e:#}"));
}

async fn send_notification(
  notification: &NotificationConfig,
  version: &str,
) -> anyhow::Result<()> {
  if !notification.enabled {
    return Ok(());
  }
  match notification.service {
    NotificationService::Mattermost => {
      mattermost::send(notification, version)
        .await
        .with_context(|| {
          format!(
            "Failed to notify mattermost channel {}",
            notification.channel_id
          )
        })
    }
    NotificationService::Unknown => {
      warn!(
        "Skipping notification with unrecognized service kind | url: {}",
        notification.url
      );
      Ok(())
    }
  }
}

mod mattermost {
  use super::*;

  pub async fn send(
    notification: &NotificationConfig,
    version: &str,
  ) -> anyhow::Result<()> {
    let message =
      notification.message.replace("{{version}}", version);
    let base = notification.url.trim_end_matches('/');
    let response = http_client()
      .post(format!("{base}/api/v4/posts"))
      .bearer_auth(&notification.personal_token)
      .json(&serde_json::json!({
        "channel_id": notification.channel_id,
        "message": message,
      }))
      .timeout(NOTIFY_TIMEOUT)
      .send()
      .await
      .context("Failed to send message")?;
    let status = response.status();
    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      return Err(anyhow!(
        "Mattermost post returned {status} | {text}"
      ));
    }
    debug!("mattermost notification sent: {status}");

    if let Some(name) = &notification.header_unique_name {
      update_channel_header(notification, name, version).await?;
    }
    Ok(())
  }

  /// Advertises the deployed version in the channel header under
  /// the configured label, replacing a previous entry with the
  /// same label and preserving the rest of the header.
  async fn update_channel_header(
    notification: &NotificationConfig,
    name: &str,
    version: &str,
  ) -> anyhow::Result<()> {
    let base = notification.url.trim_end_matches('/');
    let channel_url = format!(
      "{base}/api/v4/channels/{}",
      notification.channel_id
    );

    let channel: serde_json::Value = http_client()
      .get(&channel_url)
      .bearer_auth(&notification.personal_token)
      .timeout(NOTIFY_TIMEOUT)
      .send()
      .await
      .context("Failed to get channel")?
      .json()
      .await
      .context("Channel response is not json")?;
    let header = channel
      .get("header")
      .and_then(serde_json::Value::as_str)
      .unwrap_or_default();

    let entry = format!("{name}:{version}");
    let pattern =
      regex::Regex::new(&format!(r"{}:\S+", regex::escape(name)))
        .context("Invalid header label")?;
    let header = if pattern.is_match(header) {
      pattern.replace(header, entry.as_str()).into_owned()
    } else if header.is_empty() {
      entry
    } else {
      format!("{header} {entry}")
    };

    let response = http_client()
      .put(format!("{channel_url}/patch"))
      .bearer_auth(&notification.personal_token)
      .json(&serde_json::json!({ "header": header }))
      .timeout(NOTIFY_TIMEOUT)
      .send()
      .await
      .context("Failed to patch channel header")?;
    let status = response.status();
    if !status.is_success() {
      return Err(anyhow!(
        "Mattermost channel patch returned {status}"
      ));
    }
    Ok(())
  }
}

fn http_client() -> &'static reqwest::Client {
  static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
  CLIENT.get_or_init(reqwest::Client::new)
}

#[cfg(test)]
mod tests {
  use wiremock::matchers::{body_partial_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  use super::*;

  fn notification(
    url: String,
    header: Option<&str>,
  ) -> NotificationConfig {
    NotificationConfig {
      service: NotificationService::Mattermost,
      url,
      message: String::from("Deployed {{version}}"),
      enabled: true,
      channel_id: String::from("chan1"),
      personal_token: String::from("tok"),
      header_unique_name: header.map(String::from),
    }
  }

  #[tokio::test]
  async fn posts_message_with_substituted_version() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/v4/posts"))
      .and(body_partial_json(serde_json::json!({
        "channel_id": "chan1",
        "message": "Deployed v1.2.3",
      })))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;

    notify_deployed(
      &[notification(server.uri(), None)],
      "v1.2.3",
    )
    .await;
  }

  #[tokio::test]
  async fn one_failing_webhook_does_not_cancel_others() {
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/v4/posts"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&broken)
      .await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/v4/posts"))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&healthy)
      .await;

    notify_deployed(
      &[
        notification(broken.uri(), None),
        notification(healthy.uri(), None),
      ],
      "v1.2.3",
    )
    .await;
  }

  #[tokio::test]
  async fn patches_channel_header_with_version_label() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/v4/posts"))
      .respond_with(ResponseTemplate::new(201))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/api/v4/channels/chan1"))
      .respond_with(ResponseTemplate::new(200).set_body_json(
        serde_json::json!({
          "header": "staging:v1.0.0 | docs: http://wiki",
        }),
      ))
      .mount(&server)
      .await;
    Mock::given(method("PUT"))
      .and(path("/api/v4/channels/chan1/patch"))
      .and(body_partial_json(serde_json::json!({
        "header": "staging:v1.2.3 | docs: http://wiki",
      })))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;

    notify_deployed(
      &[notification(server.uri(), Some("staging"))],
      "v1.2.3",
    )
    .await;
  }

  #[tokio::test]
  async fn disabled_notifications_are_skipped() {
    let server = MockServer::start().await;
    // No mocks mounted: any request would 404 and log, but the
    // disabled entry never sends one.
    let mut notification = notification(server.uri(), None);
    notification.enabled = false;
    notify_deployed(&[notification], "v1.2.3").await;
    assert!(server.received_requests().await.unwrap().is_empty());
  }
}
