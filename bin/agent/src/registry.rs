//! Resolves image tags to content digests against their
//! registries, without pulling anything.

use std::time::Duration;

use anyhow::{Context, anyhow};
use futures::future::join_all;

use crate::{config::RegistryConfig, fingerprint};

const MANIFEST_ACCEPT: &str =
  "application/vnd.docker.distribution.manifest.v2+json, \
   application/vnd.docker.distribution.manifest.list.v2+json, \
   application/vnd.oci.image.manifest.v1+json, \
   application/vnd.oci.image.index.v1+json";

const DOCKER_HUB: &str = "registry-1.docker.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImage {
  pub registry: String,
  pub repository: String,
  pub tag: String,
}

/// Splits a docker image reference into registry, repository and
/// tag. Bare names fall back to Docker Hub with the `library/`
/// namespace; `@sha256:` pins are stripped before resolution.
pub fn parse_image(image_ref: &str) -> ParsedImage {
  let mut reference = image_ref.trim().to_string();

  if let Some(pos) = reference.find("@sha256:") {
    reference.truncate(pos);
  }

  let mut registry = DOCKER_HUB.to_string();
  let mut tag = String::from("latest");

  let last_colon = reference.rfind(':');
  let last_slash = reference.rfind('/');
  if let Some(colon_pos) = last_colon
    && colon_pos > last_slash.unwrap_or(0)
  {
    tag = reference[colon_pos + 1..].to_string();
    reference.truncate(colon_pos);
  }

  let parts = reference.split('/').collect::<Vec<_>>();
  let repository = if parts.len() >= 2
    && (parts[0].contains('.') || parts[0].contains(':'))
  {
    registry = parts[0].to_string();
    parts[1..].join("/")
  } else if parts.len() == 1 {
    format!("library/{}", parts[0])
  } else {
    reference
  };

  ParsedImage {
    registry,
    repository,
    tag,
  }
}

pub struct RegistryClient {
  http: reqwest::Client,
  registries: Vec<RegistryConfig>,
}

impl RegistryClient {
  pub fn new(
    registries: Vec<RegistryConfig>,
    timeout: Duration,
  ) -> anyhow::Result<RegistryClient> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .context("Failed to build registry http client")?;
    Ok(RegistryClient { http, registries })
  }

  /// The configured registry whose url covers this host.
  fn config_for(&self, host: &str) -> Option<&RegistryConfig> {
    self
      .registries
      .iter()
      .find(|registry| registry.url.contains(host))
  }

  fn manifest_url(&self, image: &ParsedImage) -> String {
    match self.config_for(&image.registry) {
      Some(registry) => format!(
        "{}/{}/manifests/{}",
        registry.url.trim_end_matches('/'),
        image.repository,
        image.tag,
      ),
      None => format!(
        "https://{}/v2/{}/manifests/{}",
        image.registry, image.repository, image.tag,
      ),
    }
  }

  /// HEADs the manifest for the image's tag and returns the
  /// `Docker-Content-Digest`, honoring a bearer-token challenge
  /// with the configured credentials.
  pub async fn resolve(
    &self,
    image_ref: &str,
  ) -> anyhow::Result<String> {
    let image = parse_image(image_ref);
    let manifest_url = self.manifest_url(&image);

    let response = self
      .http
      .head(&manifest_url)
      .header("Accept", MANIFEST_ACCEPT)
      .send()
      .await
      .with_context(|| {
        format!("Manifest request failed for {image_ref}")
      })?;

    let response = if response.status()
      == reqwest::StatusCode::UNAUTHORIZED
    {
      let challenge = response
        .headers()
        .get("www-authenticate")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
      let token = self
        .fetch_bearer_token(&challenge, &image)
        .await
        .with_context(|| {
          format!("Registry auth failed for {image_ref}")
        })?;
      self
        .http
        .head(&manifest_url)
        .header("Accept", MANIFEST_ACCEPT)
        .bearer_auth(token)
        .send()
        .await
        .with_context(|| {
          format!("Manifest request failed for {image_ref}")
        })?
    } else {
      response
    };

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
      return Err(anyhow!("Image not found: {image_ref}"));
    }
    if !status.is_success() {
      return Err(anyhow!(
        "Manifest request for {image_ref} returned {status}"
      ));
    }

    response
      .headers()
      .get("docker-content-digest")
      .and_then(|value| value.to_str().ok())
      .map(String::from)
      .with_context(|| {
        format!("No Docker-Content-Digest header for {image_ref}")
      })
  }

  /// Parses the Www-Authenticate challenge and fetches a pull
  /// token, using the registry's configured credentials when
  /// present.
  async fn fetch_bearer_token(
    &self,
    challenge: &str,
    image: &ParsedImage,
  ) -> anyhow::Result<String> {
    let realm = capture(challenge, r#"realm="([^"]+)""#)
      .context("Challenge has no realm")?;
    let service =
      capture(challenge, r#"service="([^"]+)""#).unwrap_or_default();

    let scope = format!("repository:{}:pull", image.repository);
    let token_url = format!(
      "{realm}?service={}&scope={}",
      urlencoding::encode(&service),
      urlencoding::encode(&scope),
    );

    let mut request = self.http.get(&token_url);
    if let Some(registry) = self.config_for(&image.registry)
      && let Some(username) = &registry.username
    {
      request =
        request.basic_auth(username, registry.password.as_ref());
    }

    let response = request
      .send()
      .await
      .context("Token request failed")?;
    let status = response.status();
    if !status.is_success() {
      return Err(anyhow!("Token request returned {status}"));
    }

    let data: serde_json::Value = response
      .json()
      .await
      .context("Token response is not json")?;
    data
      .get("token")
      .or_else(|| data.get("access_token"))
      .and_then(|value| value.as_str())
      .map(String::from)
      .context("Token response has no token")
  }

  /// Resolves every image concurrently and digests the sorted
  /// `(ref, digest)` pairs.
  pub async fn images_fingerprint(
    &self,
    image_refs: &[String],
  ) -> anyhow::Result<(String, Vec<(String, String)>)> {
    let digests = join_all(
      image_refs.iter().map(|image| self.resolve(image)),
    )
    .await;
    let mut pairs = Vec::with_capacity(image_refs.len());
    for (image, digest) in image_refs.iter().zip(digests) {
      pairs.push((image.clone(), digest?));
    }
    Ok((fingerprint::images_fingerprint(&pairs), pairs))
  }
}

fn capture(input: &str, pattern: &str) -> Option<String> {
  regex::Regex::new(pattern)
    .ok()?
    .captures(input)?
    .get(1)
    .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
  use wiremock::matchers::{header_exists, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  use super::*;

  #[test]
  fn parses_bare_image() {
    assert_eq!(
      parse_image("postgres"),
      ParsedImage {
        registry: DOCKER_HUB.to_string(),
        repository: String::from("library/postgres"),
        tag: String::from("latest"),
      }
    );
  }

  #[test]
  fn parses_private_registry_with_port_and_tag() {
    assert_eq!(
      parse_image("registry.example.com:5000/org/web:1.2"),
      ParsedImage {
        registry: String::from("registry.example.com:5000"),
        repository: String::from("org/web"),
        tag: String::from("1.2"),
      }
    );
  }

  #[test]
  fn strips_digest_pins() {
    let parsed = parse_image("redis@sha256:deadbeef");
    assert_eq!(parsed.repository, "library/redis");
    assert_eq!(parsed.tag, "latest");
  }

  #[tokio::test]
  async fn resolves_digest_from_head() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
      .and(path("/v2/org/web/manifests/latest"))
      .respond_with(
        ResponseTemplate::new(200)
          .insert_header("Docker-Content-Digest", "sha256:abc123"),
      )
      .mount(&server)
      .await;

    let host = server.uri().trim_start_matches("http://").to_string();
    let client = RegistryClient::new(
      vec![RegistryConfig {
        url: format!("{}/v2", server.uri()),
        username: None,
        password: None,
      }],
      Duration::from_secs(5),
    )
    .unwrap();

    let digest = client
      .resolve(&format!("{host}/org/web:latest"))
      .await
      .unwrap();
    assert_eq!(digest, "sha256:abc123");
  }

  #[tokio::test]
  async fn honors_bearer_challenge() {
    let server = MockServer::start().await;
    let token_url = format!("{}/token", server.uri());
    Mock::given(method("HEAD"))
      .and(path("/v2/org/web/manifests/latest"))
      .and(header_exists("Authorization"))
      .respond_with(
        ResponseTemplate::new(200)
          .insert_header("Docker-Content-Digest", "sha256:def456"),
      )
      .mount(&server)
      .await;
    Mock::given(method("HEAD"))
      .and(path("/v2/org/web/manifests/latest"))
      .respond_with(ResponseTemplate::new(401).insert_header(
        "Www-Authenticate",
        format!(
          "Bearer realm=\"{token_url}\",service=\"registry\""
        )
        .as_str(),
      ))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/token"))
      .and(query_param("service", "registry"))
      .respond_with(ResponseTemplate::new(200).set_body_json(
        serde_json::json!({ "token": "tok123" }),
      ))
      .mount(&server)
      .await;

    let host = server.uri().trim_start_matches("http://").to_string();
    let client = RegistryClient::new(
      vec![RegistryConfig {
        url: format!("{}/v2", server.uri()),
        username: Some(String::from("puller")),
        password: Some(String::from("hunter2")),
      }],
      Duration::from_secs(5),
    )
    .unwrap();

    let digest = client
      .resolve(&format!("{host}/org/web:latest"))
      .await
      .unwrap();
    assert_eq!(digest, "sha256:def456");
  }

  #[tokio::test]
  async fn missing_image_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
      .respond_with(ResponseTemplate::new(404))
      .mount(&server)
      .await;

    let host = server.uri().trim_start_matches("http://").to_string();
    let client = RegistryClient::new(
      vec![RegistryConfig {
        url: format!("{}/v2", server.uri()),
        username: None,
        password: None,
      }],
      Duration::from_secs(5),
    )
    .unwrap();

    let err = client
      .resolve(&format!("{host}/org/gone:latest"))
      .await
      .unwrap_err();
    assert!(err.to_string().contains("not found"));
  }
}
