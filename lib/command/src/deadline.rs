use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, anyhow};
use nix::{
  sys::signal::{Signal, kill},
  unistd::Pid,
};
use tokio::{
  io::AsyncReadExt,
  process::{Child, Command},
};
use tokio_util::sync::CancellationToken;

use crate::{Log, agent_timestamp};

/// Time between SIGTERM and SIGKILL when a command exceeds its
/// deadline or the agent is shutting down.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Runs `command` with `/bin/sh -c` in `path`, inheriting the
/// process environment plus `envs`. The process is terminated
/// (SIGTERM, then SIGKILL after [KILL_GRACE]) when `deadline`
/// elapses or `cancel` fires. Cancellation is an Err, a missed
/// deadline is an unsuccessful [Log].
pub async fn run_with_deadline(
  stage: &str,
  path: &Path,
  command: &str,
  envs: &[(String, String)],
  deadline: Duration,
  cancel: &CancellationToken,
) -> anyhow::Result<Log> {
  let start_ts = agent_timestamp();
  let mut child = Command::new("/bin/sh")
    .arg("-c")
    .arg(command)
    .current_dir(path)
    .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .with_context(|| {
      format!("Failed to spawn command in {path:?}")
    })?;

  let mut stdout_pipe =
    child.stdout.take().context("Child stdout not captured")?;
  let mut stderr_pipe =
    child.stderr.take().context("Child stderr not captured")?;
  let stdout_task = tokio::spawn(async move {
    let mut buf = Vec::new();
    stdout_pipe.read_to_end(&mut buf).await.ok();
    buf
  });
  let stderr_task = tokio::spawn(async move {
    let mut buf = Vec::new();
    stderr_pipe.read_to_end(&mut buf).await.ok();
    buf
  });

  let waited = tokio::time::timeout(deadline, async {
    tokio::select! {
      status = child.wait() => Some(status),
      _ = cancel.cancelled() => None,
    }
  })
  .await;

  let status = match waited {
    // Finished before the deadline.
    Ok(Some(status)) => {
      Some(status.context("Failed to wait on command")?)
    }
    // Shutdown.
    Ok(None) => {
      terminate(&mut child).await;
      return Err(anyhow!("Command cancelled by shutdown"));
    }
    // Deadline elapsed.
    Err(_) => {
      terminate(&mut child).await;
      None
    }
  };

  let stdout =
    String::from_utf8_lossy(&stdout_task.await.unwrap_or_default())
      .into_owned();
  let mut stderr =
    String::from_utf8_lossy(&stderr_task.await.unwrap_or_default())
      .into_owned();

  let success = match status {
    Some(status) => status.success(),
    None => {
      if !stderr.is_empty() {
        stderr.push('\n');
      }
      stderr.push_str(&format!(
        "Command exceeded deadline of {}s and was terminated",
        deadline.as_secs()
      ));
      false
    }
  };

  Ok(Log {
    stage: stage.to_string(),
    command: command.to_string(),
    stdout,
    stderr,
    success,
    start_ts,
    end_ts: agent_timestamp(),
  })
}

async fn terminate(child: &mut Child) {
  if let Some(pid) = child.id() {
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    if tokio::time::timeout(KILL_GRACE, child.wait())
      .await
      .is_ok()
    {
      return;
    }
  }
  let _ = child.start_kill();
  let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn runs_in_working_directory_with_env() {
    let dir = tempfile::tempdir().unwrap();
    let log = run_with_deadline(
      "Pwd",
      dir.path(),
      "echo $PWD $RECIPE_VAR",
      &[("RECIPE_VAR".to_string(), "staged".to_string())],
      Duration::from_secs(10),
      &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(log.success);
    assert!(log.stdout.contains("staged"));
  }

  #[tokio::test]
  async fn deadline_kills_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let log = run_with_deadline(
      "Sleep",
      dir.path(),
      "sleep 30",
      &[],
      Duration::from_millis(200),
      &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(!log.success);
    assert!(log.stderr.contains("deadline"));
  }

  #[tokio::test]
  async fn cancellation_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let res = run_with_deadline(
      "Sleep",
      dir.path(),
      "sleep 30",
      &[],
      Duration::from_secs(10),
      &cancel,
    )
    .await;
    assert!(res.is_err());
  }
}
