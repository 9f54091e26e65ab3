//! Change detection digests.
//!
//! Fingerprints are compared for equality across cycles, nothing
//! more. Both kinds hash a canonical line set: lines are sorted
//! before hashing so configuration order never changes the digest.

use std::path::Path;

use anyhow::{Context, anyhow};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// One synced repo as seen by the source fingerprint.
pub struct RepoContent<'a> {
  pub repo_id: &'a str,
  pub resolved_ref: &'a str,
  pub workdir: &'a Path,
  /// Path selectors: plain paths or wildcard patterns.
  pub paths: &'a [String],
  pub matched_tag: Option<&'a str>,
}

pub fn hash_bytes(bytes: &[u8]) -> String {
  hex::encode(Sha256::digest(bytes))
}

fn hash_lines(mut lines: Vec<String>) -> String {
  lines.sort();
  hash_bytes(lines.join("\n").as_bytes())
}

/// Digest over `(repo, ref, path, content digest)` for every file
/// matched by every selector, plus the matched tag when tag-sync
/// is active. A selector matching nothing contributes a `0` line
/// instead of failing the cycle.
pub fn source_fingerprint(
  repos: &[RepoContent],
) -> anyhow::Result<String> {
  let mut lines = Vec::new();
  for repo in repos {
    for selector in repo.paths {
      let matched = select_files(repo.workdir, selector)?;
      if matched.is_empty() {
        lines.push(format!(
          "{}|{}|{selector}|0",
          repo.repo_id, repo.resolved_ref,
        ));
        continue;
      }
      for rel_path in matched {
        let bytes = std::fs::read(repo.workdir.join(&rel_path))
          .with_context(|| {
            format!(
              "Failed to read {rel_path} in repo '{}'",
              repo.repo_id
            )
          })?;
        lines.push(format!(
          "{}|{}|{rel_path}|{}",
          repo.repo_id,
          repo.resolved_ref,
          hash_bytes(&bytes),
        ));
      }
    }
    if let Some(tag) = repo.matched_tag {
      lines.push(format!("{}|tag|{tag}", repo.repo_id));
    }
  }
  Ok(hash_lines(lines))
}

/// Digest over sorted `(image ref, resolved digest)` pairs.
pub fn images_fingerprint(pairs: &[(String, String)]) -> String {
  hash_lines(
    pairs
      .iter()
      .map(|(image, digest)| format!("{image}|{digest}"))
      .collect(),
  )
}

/// Relative paths in `workdir` matched by `selector`, sorted.
/// A selector without wildcard characters is a plain path.
fn select_files(
  workdir: &Path,
  selector: &str,
) -> anyhow::Result<Vec<String>> {
  if !selector.contains(['*', '?']) {
    let path = workdir.join(selector);
    return Ok(if path.is_file() {
      vec![selector.to_string()]
    } else {
      Vec::new()
    });
  }

  let pattern = wildcard::Wildcard::new(selector.as_bytes())
    .map_err(|e| {
      anyhow!("Invalid path selector '{selector}' | {e:?}")
    })?;

  let mut matched = Vec::new();
  for entry in WalkDir::new(workdir)
    .into_iter()
    .filter_entry(|e| e.file_name() != ".git")
  {
    let entry = entry.with_context(|| {
      format!("Failed to walk working copy at {workdir:?}")
    })?;
    if !entry.file_type().is_file() {
      continue;
    }
    let Ok(rel_path) = entry.path().strip_prefix(workdir) else {
      continue;
    };
    let rel_path = rel_path.to_string_lossy().replace('\\', "/");
    if pattern.is_match(rel_path.as_bytes()) {
      matched.push(rel_path);
    }
  }
  matched.sort();
  Ok(matched)
}
