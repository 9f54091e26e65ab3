use std::path::Path;

use command::{agent_timestamp, run_agent_command};
use run_command::async_run_command;

use crate::{GitRes, RepoSyncArgs, get_commit_hash_log, scrub};

/// Deletes any existing working copy and shallow-clones the
/// configured branch. Tags reachable from the tip are fetched
/// afterwards so tag-sync can resolve them on the first cycle.
#[tracing::instrument(level = "debug", skip(args), fields(repo = %args.id))]
pub async fn clone(
  args: &RepoSyncArgs,
  root_repo_dir: &Path,
) -> anyhow::Result<GitRes> {
  let repo_dir = args.path(root_repo_dir);
  let repo_url = args.remote_url()?;

  let _ = std::fs::remove_dir_all(&repo_dir);
  if let Some(parent) = repo_dir.parent() {
    let _ = std::fs::create_dir_all(parent);
  }

  let command = format!(
    "git clone --depth 1 {repo_url} {} -b {}",
    repo_dir.display(),
    args.branch,
  );
  let start_ts = agent_timestamp();
  let output = async_run_command(&command).await;
  let mut logs = vec![command::output_into_log(
    "Clone Repo", command, start_ts, output,
  )];

  if logs[0].success {
    let fetch_tags = run_agent_command(
      "Fetch Tags",
      repo_dir.as_path(),
      "git fetch --force --tags origin",
    )
    .await;
    logs.push(fetch_tags);
  }

  if let Some(secret) = &args.secret {
    for log in &mut logs {
      scrub(log, secret);
    }
  }

  if !command::all_logs_success(&logs) {
    tracing::warn!(
      "Failed to clone repo at {repo_dir:?} | repo: {} | {logs:?}",
      args.id
    );
    return Ok(GitRes {
      logs,
      hash: None,
      message: None,
    });
  }

  tracing::debug!("repo at {repo_dir:?} cloned");

  let (hash, message) = match get_commit_hash_log(&repo_dir).await {
    Ok((log, hash, message)) => {
      logs.push(log);
      (Some(hash), Some(message))
    }
    Err(e) => {
      logs.push(command::Log::error(
        "Latest Commit",
        format!("{:#}", e.context("Failed to get latest commit")),
      ));
      (None, None)
    }
  };

  Ok(GitRes {
    logs,
    hash,
    message,
  })
}
