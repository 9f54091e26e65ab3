use std::path::Path;

use run_command::{CommandOutput, async_run_command};
use serde::{Deserialize, Serialize};

mod deadline;

pub use deadline::run_with_deadline;

/// The result of one executed stage (shell command or
/// synthetic step), with captured streams for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: i64,
  pub end_ts: i64,
}

impl Log {
  pub fn simple(
    stage: impl Into<String>,
    msg: impl Into<String>,
  ) -> Log {
    let ts = agent_timestamp();
    Log {
      stage: stage.into(),
      stdout: msg.into(),
      success: true,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  pub fn error(
    stage: impl Into<String>,
    msg: impl Into<String>,
  ) -> Log {
    let ts = agent_timestamp();
    Log {
      stage: stage.into(),
      stderr: msg.into(),
      success: false,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }
}

pub fn all_logs_success(logs: &[Log]) -> bool {
  logs.iter().all(|log| log.success)
}

/// Current unix timestamp in milliseconds.
pub fn agent_timestamp() -> i64 {
  async_timing_util::unix_timestamp_ms() as i64
}

pub async fn run_agent_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> Log {
  let command = if let Some(path) = path.into() {
    format!("cd {} && {}", path.display(), command.as_ref())
  } else {
    command.as_ref().to_string()
  };
  let start_ts = agent_timestamp();
  let output = async_run_command(&command).await;
  output_into_log(stage, command, start_ts, output)
}

pub fn output_into_log(
  stage: &str,
  command: String,
  start_ts: i64,
  output: CommandOutput,
) -> Log {
  let success = output.success();
  Log {
    stage: stage.to_string(),
    stdout: output.stdout,
    stderr: output.stderr,
    command,
    success,
    start_ts,
    end_ts: agent_timestamp(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn captures_stdout_and_exit_status() {
    let log =
      run_agent_command("Echo", None, "echo hello world").await;
    assert!(log.success);
    assert_eq!(log.stdout.trim(), "hello world");
  }

  #[tokio::test]
  async fn nonzero_exit_is_failure() {
    let log = run_agent_command("Fail", None, "exit 3").await;
    assert!(!log.success);
  }

  #[test]
  fn all_logs_success_requires_every_log() {
    let logs =
      vec![Log::simple("a", "ok"), Log::error("b", "boom")];
    assert!(!all_logs_success(&logs));
    assert!(all_logs_success(&logs[..1]));
  }
}
