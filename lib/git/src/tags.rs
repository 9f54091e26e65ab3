use std::path::Path;

use anyhow::anyhow;
use command::{Log, run_agent_command};
use regex::Regex;

/// Finds the highest-sorted tag matching `pattern` reachable from
/// the current HEAD. Returns None when no tag matches, which the
/// caller treats as a no-op cycle rather than an error.
pub async fn highest_matching_tag(
  repo_dir: &Path,
  pattern: &Regex,
) -> anyhow::Result<(Log, Option<String>)> {
  let log = run_agent_command(
    "List Tags",
    repo_dir,
    "git tag --list --merged HEAD",
  )
  .await;
  if !log.success {
    return Err(anyhow!("Failed to list tags | {}", log.stderr));
  }
  let tag = log
    .stdout
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty() && pattern.is_match(line))
    .max()
    .map(String::from);
  Ok((log, tag))
}

pub async fn checkout_tag(
  repo_dir: &Path,
  tag: &str,
) -> anyhow::Result<Log> {
  let log = run_agent_command(
    "Checkout Tag",
    repo_dir,
    format!("git checkout -f tags/{tag}"),
  )
  .await;
  if !log.success {
    return Err(anyhow!(
      "Failed to checkout tag '{tag}' | {}",
      log.stderr
    ));
  }
  Ok(log)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pick(lines: &str, pattern: &str) -> Option<String> {
    let pattern = Regex::new(pattern).unwrap();
    lines
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty() && pattern.is_match(line))
      .max()
      .map(String::from)
  }

  #[test]
  fn picks_highest_sorted_matching_tag() {
    let tags = "v1.2.3\nstaging\nv1.10.0\nv1.9.9\n";
    // Plain lexicographic sort, as documented.
    assert_eq!(
      pick(tags, r"^v\d+\.\d+\.\d+$").as_deref(),
      Some("v1.9.9")
    );
  }

  #[test]
  fn no_matching_tag_is_none() {
    assert_eq!(pick("staging\nlatest\n", r"^v\d+\.\d+\.\d+$"), None);
  }
}
