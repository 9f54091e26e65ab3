use std::path::Path;

use command::{Log, all_logs_success, run_agent_command};

use crate::{GitRes, RepoSyncArgs, get_commit_hash_log, scrub};

/// Brings an existing working copy up to the remote branch tip.
/// Handles edge cases from possible state of the repo: rotated
/// credentials (remote re-set every pull), a detached HEAD left
/// behind by a tag checkout (forced branch checkout), and remote
/// history rewrites (hard reset to the fetched tip).
#[tracing::instrument(level = "debug", skip(args), fields(repo = %args.id))]
pub async fn pull(
  args: &RepoSyncArgs,
  root_repo_dir: &Path,
) -> anyhow::Result<GitRes> {
  let path = args.path(root_repo_dir);
  let repo_url = args.remote_url()?;

  let mut logs = Vec::new();

  let set_remote = run_agent_command(
    "Set Remote",
    path.as_path(),
    format!("git remote set-url origin {repo_url}"),
  )
  .await;
  logs.push(set_remote);

  if all_logs_success(&logs) {
    let checkout = run_agent_command(
      "Checkout Branch",
      path.as_path(),
      format!("git checkout -f {}", args.branch),
    )
    .await;
    logs.push(checkout);
  }

  if all_logs_success(&logs) {
    let fetch = run_agent_command(
      "Fetch",
      path.as_path(),
      format!("git fetch --force --tags origin {}", args.branch),
    )
    .await;
    logs.push(fetch);
  }

  if all_logs_success(&logs) {
    let reset = run_agent_command(
      "Fast Forward",
      path.as_path(),
      format!("git reset --hard origin/{}", args.branch),
    )
    .await;
    logs.push(reset);
  }

  if let Some(secret) = &args.secret {
    for log in &mut logs {
      scrub(log, secret);
    }
  }

  if !all_logs_success(&logs) {
    return Ok(GitRes {
      logs,
      hash: None,
      message: None,
    });
  }

  let (hash, message) = match get_commit_hash_log(&path).await {
    Ok((log, hash, message)) => {
      logs.push(log);
      (Some(hash), Some(message))
    }
    Err(e) => {
      logs.push(Log::error(
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
