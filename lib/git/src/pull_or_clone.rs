use std::path::Path;

use command::{Log, all_logs_success};

use crate::{GitRes, RepoSyncArgs};

/// This is a mix of clone / pull.
///   - If the working copy doesn't exist, it will clone the repo.
///     - Second variable in tuple will be `true`
///   - If it does, it will pull. A failed pull is treated as a
///     corrupt working tree: the directory is deleted and cloned
///     fresh.
#[tracing::instrument(
  level = "debug",
  skip(args),
  fields(repo = %args.id)
)]
pub async fn pull_or_clone(
  args: &RepoSyncArgs,
  root_repo_dir: &Path,
) -> anyhow::Result<(GitRes, bool)> {
  let folder_path = args.path(root_repo_dir);

  if !folder_path.exists() {
    return crate::clone(args, root_repo_dir)
      .await
      .map(|res| (res, true));
  }

  let res = crate::pull(args, root_repo_dir).await?;
  if all_logs_success(&res.logs) {
    return Ok((res, false));
  }

  tracing::warn!(
    "Pull failed for repo '{}', recovering with fresh clone | {:?}",
    args.id,
    res.logs,
  );
  let mut recovered = crate::clone(args, root_repo_dir).await?;
  recovered.logs.insert(
    0,
    Log::simple(
      "Recover Working Copy",
      "Deleted working copy after failed pull, cloning fresh",
    ),
  );
  Ok((recovered, true))
}
