//! Turns synced working copies plus the configured recipe into a
//! deployable stack descriptor: stage files, run the user command,
//! read the stack file back, rewrite, emit canonical bytes.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context, anyhow};
use command::{Log, run_with_deadline};
use tokio_util::sync::CancellationToken;

use crate::{
  compose,
  config::{RecipeConfig, Workdir},
  error::CycleError,
  fingerprint,
};

#[derive(Debug)]
pub struct RecipeOutput {
  /// Canonical yaml, the exact bytes handed to the orchestrator.
  pub yaml: String,
  /// SHA-256 of `yaml`.
  pub digest: String,
  /// Image references of the emitted descriptor.
  pub images: Vec<String>,
  pub logs: Vec<Log>,
}

pub async fn assemble(
  recipe: &RecipeConfig,
  repo_paths: &HashMap<String, PathBuf>,
  work_root: &Path,
  cancel: &CancellationToken,
) -> Result<RecipeOutput, CycleError> {
  let mut logs = Vec::new();

  // Stage. A temporary workdir is created fresh per cycle; a repo
  // workdir is the working copy itself, already reset by the sync.
  // The scratch guard keeps the directory alive until emit.
  let mut _scratch: Option<tempfile::TempDir> = None;
  let workdir: PathBuf = match &recipe.workdir {
    Workdir::Repo(id) => repo_paths
      .get(id)
      .ok_or_else(|| {
        CycleError::recipe(anyhow!("Unknown workdir repo '{id}'"))
      })?
      .clone(),
    Workdir::Temporary => {
      std::fs::create_dir_all(work_root)
        .context("Failed to create recipe work root")
        .map_err(CycleError::transient)?;
      let scratch = tempfile::Builder::new()
        .prefix("recipe-")
        .tempdir_in(work_root)
        .context("Failed to create recipe scratch directory")
        .map_err(CycleError::transient)?;
      let path = scratch.path().to_path_buf();
      _scratch = Some(scratch);
      path
    }
  };

  stage_files(recipe, repo_paths, &workdir, &mut logs)?;
  if cancel.is_cancelled() {
    return Err(CycleError::Cancelled);
  }

  // Execute. An empty command with a configured stack file means:
  // read the staged file directly.
  match recipe.command.as_deref().map(str::trim) {
    Some(command) if !command.is_empty() => {
      let log = run_with_deadline(
        "Run Recipe",
        &workdir,
        command,
        &[],
        Duration::from_secs(recipe.command_deadline),
        cancel,
      )
      .await
      .map_err(|e| {
        if cancel.is_cancelled() {
          CycleError::Cancelled
        } else {
          CycleError::recipe(e)
        }
      })?;
      let success = log.success;
      let stderr = log.stderr.clone();
      logs.push(log);
      if !success {
        return Err(CycleError::recipe(anyhow!(
          "Recipe command exited non-zero | {stderr}"
        )));
      }
    }
    _ => logs.push(Log::simple(
      "Run Recipe",
      "No command configured, reading staged stack file",
    )),
  }

  // Read.
  let stack_path = workdir.join(&recipe.stack_file);
  let contents = std::fs::read_to_string(&stack_path)
    .with_context(|| {
      format!("Failed to read stack file at {stack_path:?}")
    })
    .map_err(CycleError::recipe)?;
  let mut doc =
    compose::parse(&contents).map_err(CycleError::recipe)?;

  // Rewrite, in order. Each step is total.
  compose::prefix_services(&mut doc, &recipe.services_prefix);
  let dropped_services = compose::exclude_services(
    &mut doc,
    &recipe.excluded_services,
    &recipe.services_prefix,
  );
  if !dropped_services.is_empty() {
    logs.push(Log::simple(
      "Exclude Services",
      format!("Dropped services: {}", dropped_services.join(", ")),
    ));
  }
  let dropped_volumes =
    compose::exclude_volumes(&mut doc, &recipe.excluded_volumes);
  if !dropped_volumes.is_empty() {
    logs.push(Log::simple(
      "Exclude Volumes",
      format!("Dropped volumes: {}", dropped_volumes.join(", ")),
    ));
  }
  compose::merge_additional(&mut doc, &recipe.additional_parameters);

  // Emit.
  let yaml =
    compose::canonical_yaml(&doc).map_err(CycleError::recipe)?;
  let digest = fingerprint::hash_bytes(yaml.as_bytes());
  let images = compose::image_refs(&doc);

  Ok(RecipeOutput {
    yaml,
    digest,
    images,
    logs,
  })
}

/// Copies each configured `(repo, paths)` into the working
/// directory, preserving relative structure. Copies overwrite.
fn stage_files(
  recipe: &RecipeConfig,
  repo_paths: &HashMap<String, PathBuf>,
  workdir: &Path,
  logs: &mut Vec<Log>,
) -> Result<(), CycleError> {
  for files in &recipe.files {
    let source_root = repo_paths.get(&files.id).ok_or_else(|| {
      CycleError::recipe(anyhow!(
        "Recipe stages files from unknown repo '{}'",
        files.id
      ))
    })?;
    for rel_path in &files.paths {
      let source = source_root.join(rel_path);
      let dest = workdir.join(rel_path);
      if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
          .with_context(|| {
            format!("Failed to create staging dir {parent:?}")
          })
          .map_err(CycleError::recipe)?;
      }
      std::fs::copy(&source, &dest)
        .with_context(|| {
          format!(
            "Failed to stage {rel_path} from repo '{}'",
            files.id
          )
        })
        .map_err(CycleError::recipe)?;
    }
    logs.push(Log::simple(
      "Stage Files",
      format!(
        "Staged {} file(s) from repo '{}'",
        files.paths.len(),
        files.id
      ),
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use indexmap::IndexMap;

  use super::*;
  use crate::config::RecipeFiles;

  const COMPOSE: &str = r#"
services:
  web:
    image: registry.example.com/web:latest
  webclient:
    image: registry.example.com/webclient:latest
"#;

  fn recipe(command: Option<&str>) -> RecipeConfig {
    RecipeConfig {
      files: vec![RecipeFiles {
        id: String::from("services"),
        paths: vec![String::from("services/docker-compose.yml")],
      }],
      workdir: Workdir::Temporary,
      command: command.map(String::from),
      stack_file: String::from("services/docker-compose.yml"),
      excluded_services: vec![String::from("webclient")],
      excluded_volumes: Vec::new(),
      additional_parameters: IndexMap::new(),
      services_prefix: String::from("stg"),
      command_deadline: 10,
    }
  }

  fn setup() -> (tempfile::TempDir, HashMap<String, PathBuf>) {
    let root = tempfile::tempdir().unwrap();
    let repo_dir = root.path().join("repos/services");
    std::fs::create_dir_all(repo_dir.join("services")).unwrap();
    std::fs::write(
      repo_dir.join("services/docker-compose.yml"),
      COMPOSE,
    )
    .unwrap();
    let repo_paths = HashMap::from([(
      String::from("services"),
      repo_dir,
    )]);
    (root, repo_paths)
  }

  #[tokio::test]
  async fn empty_command_reads_staged_stack_file() {
    let (root, repo_paths) = setup();
    let output = assemble(
      &recipe(None),
      &repo_paths,
      &root.path().join("work"),
      &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(output.yaml.contains("stg_web"));
    assert!(!output.yaml.contains("webclient"));
    assert_eq!(
      output.images,
      ["registry.example.com/web:latest"]
    );
  }

  #[tokio::test]
  async fn two_runs_emit_identical_bytes() {
    let (root, repo_paths) = setup();
    let recipe = recipe(Some(
      "cp services/docker-compose.yml compose.out && mv compose.out services/docker-compose.yml",
    ));
    let work_root = root.path().join("work");
    let cancel = CancellationToken::new();
    let a = assemble(&recipe, &repo_paths, &work_root, &cancel)
      .await
      .unwrap();
    let b = assemble(&recipe, &repo_paths, &work_root, &cancel)
      .await
      .unwrap();
    assert_eq!(a.yaml, b.yaml);
    assert_eq!(a.digest, b.digest);
  }

  #[tokio::test]
  async fn failing_command_aborts_the_cycle() {
    let (root, repo_paths) = setup();
    let err = assemble(
      &recipe(Some("exit 3")),
      &repo_paths,
      &root.path().join("work"),
      &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CycleError::RecipeFailed(_)));
  }

  #[tokio::test]
  async fn missing_staged_file_aborts_the_cycle() {
    let (root, repo_paths) = setup();
    let mut recipe = recipe(None);
    recipe.files[0].paths =
      vec![String::from("services/missing.yml")];
    let err = assemble(
      &recipe,
      &repo_paths,
      &root.path().join("work"),
      &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CycleError::RecipeFailed(_)));
  }

  #[tokio::test]
  async fn cancelled_token_unwinds_before_executing() {
    let (root, repo_paths) = setup();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = assemble(
      &recipe(Some("exit 0")),
      &repo_paths,
      &root.path().join("work"),
      &cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CycleError::Cancelled));
  }
}
