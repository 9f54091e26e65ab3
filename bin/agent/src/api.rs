//! Health surface. Runs on its own task and never blocks the
//! reconciler. Every response uses the enveloped schema
//! `{data}` / `{error}`.

use axum::{
  Json, Router,
  extract::{Path, State},
  http::StatusCode,
  routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{
  cors::{Any, CorsLayer},
  services::ServeFile,
};

use crate::config::AgentConfig;

#[derive(Clone)]
pub struct ApiState {
  api_version: String,
}

pub fn router(config: &AgentConfig) -> Router {
  Router::new()
    .route("/v0/", get(service_status))
    .route("/v0/check/{action}", post(check))
    .route_service(
      "/v0/api/specs",
      ServeFile::new(&config.rest.location),
    )
    .layer(
      CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any),
    )
    .with_state(ApiState {
      api_version: config.rest.version.clone(),
    })
}

async fn service_status(
  State(state): State<ApiState>,
) -> Json<Value> {
  Json(json!({
    "data": {
      "name": env!("CARGO_PKG_NAME"),
      "version": env!("CARGO_PKG_VERSION"),
      "status": "SERVICE_RUNNING",
      "api_version": state.api_version,
    }
  }))
}

/// `echo` reflects the request body inside the envelope, `fail`
/// answers with a 500 for probing error handling downstream.
async fn check(
  Path(action): Path<String>,
  body: String,
) -> (StatusCode, Json<Value>) {
  match action.as_str() {
    "echo" => {
      let echoed = serde_json::from_str::<Value>(&body)
        .unwrap_or(Value::String(body));
      (StatusCode::OK, Json(json!({ "data": echoed })))
    }
    "fail" => (
      StatusCode::INTERNAL_SERVER_ERROR,
      Json(json!({
        "error": { "message": "Failure requested by check" }
      })),
    ),
    _ => (
      StatusCode::NOT_FOUND,
      Json(json!({
        "error": { "message": format!("Unknown check '{action}'") }
      })),
    ),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn status_envelope_reports_running() {
    let Json(value) = service_status(State(ApiState {
      api_version: String::from("v0"),
    }))
    .await;
    assert_eq!(value["data"]["status"], "SERVICE_RUNNING");
    assert_eq!(value["data"]["api_version"], "v0");
    assert!(value["data"]["version"].is_string());
  }

  #[tokio::test]
  async fn echo_reflects_json_body() {
    let (status, Json(value)) = check(
      Path(String::from("echo")),
      String::from("{\"ping\": 1}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["ping"], 1);
  }

  #[tokio::test]
  async fn fail_returns_error_envelope() {
    let (status, Json(value)) =
      check(Path(String::from("fail")), String::new()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(value["error"]["message"].is_string());
  }
}
