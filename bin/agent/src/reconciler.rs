//! The reconciliation loop: observe sources, detect change,
//! assemble the stack, deploy, notify. One owning task drives all
//! components serially, so no two cycles ever overlap.

use std::{
  collections::HashMap,
  path::PathBuf,
  time::Duration,
};

use anyhow::anyhow;
use command::{agent_timestamp, all_logs_success};
use futures::future::join_all;
use git::RepoSyncArgs;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::{
  config::AgentConfig,
  error::CycleError,
  fingerprint::{self, RepoContent},
  notify,
  portainer::{DeployOutcome, PortainerClient},
  recipe,
  registry::RegistryClient,
};

const MAX_BACKOFF_MULTIPLIER: u32 = 16;
const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);
/// Consecutive orchestrator rejections before the loud error.
const REJECTION_ALARM_THRESHOLD: u32 = 5;

/// Everything remembered between cycles. Committed in one
/// assignment after the orchestrator confirms success; an aborted
/// cycle leaves it untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployState {
  pub last_source_fp: Option<String>,
  pub last_images_fp: Option<String>,
  pub last_stack_digest: Option<String>,
  /// Image refs of the last emitted descriptor, so the images
  /// fingerprint can be recomputed next cycle.
  pub last_image_refs: Vec<String>,
  pub last_ok_at: Option<i64>,
  pub last_error: Option<String>,
  pub consecutive_failures: u32,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display,
)]
pub enum Phase {
  Idle,
  Observing,
  Evaluating,
  Deploying,
  Notifying,
  Failing,
  Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
  /// Fingerprints match the previous cycle.
  NoChange,
  /// Tag-sync is on and no tag matches yet. A success, not a
  /// failure: nothing is deployable.
  TagMiss,
  /// At least one orchestrator applied the new descriptor.
  Deployed { version: String },
  /// Change detected but every orchestrator already ran the
  /// exact descriptor. No notification.
  AlreadyDeployed,
}

struct RepoWatch {
  config: crate::config::WatchedRepo,
  tag_pattern: Option<Regex>,
}

struct SyncedRepo {
  id: String,
  path: PathBuf,
  resolved_ref: String,
  matched_tag: Option<String>,
  tag_pattern_configured: bool,
}

pub struct Reconciler {
  repos: Vec<RepoWatch>,
  recipe: crate::config::RecipeConfig,
  synced_via_tags: bool,
  polling_interval: Duration,
  registry: RegistryClient,
  portainers: Vec<PortainerClient>,
  notifications: Vec<crate::config::NotificationConfig>,
  repos_root: PathBuf,
  work_root: PathBuf,
  cancel: CancellationToken,
  phase: Phase,
  state: DeployState,
}

impl Reconciler {
  pub fn new(
    config: &AgentConfig,
    cancel: CancellationToken,
  ) -> anyhow::Result<Reconciler> {
    let http_timeout =
      Duration::from_secs(config.main.http_timeout);
    let repos = config
      .main
      .watched_git_repositories
      .iter()
      .map(|repo| {
        let tag_pattern = repo
          .tags
          .as_deref()
          .map(Regex::new)
          .transpose()
          .map_err(|e| {
            anyhow!(
              "Invalid tags pattern for repo '{}' | {e}",
              repo.id
            )
          })?;
        Ok(RepoWatch {
          config: repo.clone(),
          tag_pattern,
        })
      })
      .collect::<anyhow::Result<Vec<_>>>()?;
    let portainers = config
      .main
      .portainer
      .iter()
      .map(|portainer| {
        PortainerClient::new(portainer, http_timeout)
      })
      .collect::<anyhow::Result<Vec<_>>>()?;
    let registry = RegistryClient::new(
      config.main.docker_private_registries.clone(),
      http_timeout,
    )?;
    Ok(Reconciler {
      repos,
      recipe: config.main.docker_stack_recipe.clone(),
      synced_via_tags: config.main.synced_via_tags,
      polling_interval: Duration::from_secs(
        config.main.polling_interval,
      ),
      registry,
      portainers,
      notifications: config.main.notifications.clone(),
      repos_root: config.repos_root(),
      work_root: config.work_root(),
      cancel,
      phase: Phase::Idle,
      state: DeployState::default(),
    })
  }

  pub fn spawn(self) -> tokio::task::JoinHandle<()> {
    tokio::spawn(self.run())
  }

  /// The loop. The wait is counted from the end of each cycle, so
  /// a slow cycle never overlaps the next one.
  pub async fn run(mut self) {
    info!(
      "Reconciler started | polling interval: {}s",
      self.polling_interval.as_secs()
    );
    loop {
      match self.cycle().await {
        Ok(outcome) => self.on_success(&outcome),
        Err(CycleError::Cancelled) => break,
        Err(e) => self.on_failure(e),
      }
      let wait = jittered(backoff_interval(
        self.polling_interval,
        self.state.consecutive_failures,
      ));
      self.set_phase(Phase::Idle);
      debug!("Next cycle in {}s", wait.as_secs());
      tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = self.cancel.cancelled() => break,
      }
    }
    self.set_phase(Phase::Stopping);
    info!("Reconciler stopped");
  }

  fn set_phase(&mut self, phase: Phase) {
    if self.phase != phase {
      debug!("Reconciler phase: {} -> {phase}", self.phase);
      self.phase = phase;
    }
  }

  fn on_success(&mut self, outcome: &CycleOutcome) {
    match outcome {
      CycleOutcome::NoChange => {
        debug!("Cycle complete: no change detected")
      }
      CycleOutcome::TagMiss => {
        info!("Cycle complete: no tag matches the pattern yet")
      }
      CycleOutcome::AlreadyDeployed => {
        info!(
          "Cycle complete: change detected, descriptor already deployed"
        )
      }
      CycleOutcome::Deployed { version } => {
        info!("Cycle complete: deployed {version}")
      }
    }
  }

  fn on_failure(&mut self, e: CycleError) {
    self.set_phase(Phase::Failing);
    self.state.last_error = Some(format!("{e:#}"));
    self.state.consecutive_failures =
      self.state.consecutive_failures.saturating_add(1);
    let failures = self.state.consecutive_failures;
    if matches!(e, CycleError::OrchestratorRejected(_))
      && failures >= REJECTION_ALARM_THRESHOLD
    {
      error!(
        "Orchestrator has rejected {failures} consecutive deploys, operator attention required | {e:#}"
      );
    } else {
      warn!("Cycle failed ({failures} consecutive) | {e:#}");
    }
  }

  fn check_cancel(&self) -> Result<(), CycleError> {
    if self.cancel.is_cancelled() {
      Err(CycleError::Cancelled)
    } else {
      Ok(())
    }
  }

  async fn cycle(&mut self) -> Result<CycleOutcome, CycleError> {
    self.check_cancel()?;
    self.set_phase(Phase::Observing);
    let synced = self.observe().await?;

    if self.synced_via_tags
      && synced.iter().any(|repo| {
        repo.tag_pattern_configured && repo.matched_tag.is_none()
      })
    {
      return Ok(CycleOutcome::TagMiss);
    }

    let source_fp = fingerprint::source_fingerprint(
      &synced
        .iter()
        .map(|repo| RepoContent {
          repo_id: &repo.id,
          resolved_ref: &repo.resolved_ref,
          workdir: &repo.path,
          paths: self.paths_for(&repo.id),
          matched_tag: repo.matched_tag.as_deref(),
        })
        .collect::<Vec<_>>(),
    )
    .map_err(CycleError::transient)?;

    self.check_cancel()?;
    self.set_phase(Phase::Evaluating);
    let prior_images_fp = if self.state.last_image_refs.is_empty()
    {
      None
    } else {
      let (fp, _) = self
        .registry
        .images_fingerprint(&self.state.last_image_refs)
        .await
        .map_err(CycleError::transient)?;
      Some(fp)
    };

    let source_changed =
      self.state.last_source_fp.as_deref() != Some(&source_fp);
    let images_changed =
      self.state.last_images_fp != prior_images_fp;
    if !source_changed && !images_changed {
      self.state.last_ok_at = Some(agent_timestamp());
      self.state.last_error = None;
      self.state.consecutive_failures = 0;
      return Ok(CycleOutcome::NoChange);
    }
    debug!(
      "Change detected | source changed: {source_changed} | images changed: {images_changed}"
    );

    self.check_cancel()?;
    self.set_phase(Phase::Deploying);
    let repo_paths = synced
      .iter()
      .map(|repo| (repo.id.clone(), repo.path.clone()))
      .collect::<HashMap<_, _>>();
    let output = recipe::assemble(
      &self.recipe,
      &repo_paths,
      &self.work_root,
      &self.cancel,
    )
    .await?;
    for log in &output.logs {
      debug!(
        "Recipe stage '{}' | success: {}",
        log.stage, log.success
      );
    }

    self.check_cancel()?;
    let (images_fp, _) = self
      .registry
      .images_fingerprint(&output.images)
      .await
      .map_err(CycleError::transient)?;

    let mut any_deployed = false;
    for portainer in &self.portainers {
      let outcome = portainer
        .deploy(
          &output.yaml,
          &output.digest,
          self.state.last_stack_digest.as_deref(),
          &self.cancel,
        )
        .await?;
      match outcome {
        DeployOutcome::Deployed { created } => {
          info!(
            "{} stack '{}' | digest: {}",
            if created { "Created" } else { "Updated" },
            portainer.stack_name(),
            output.digest,
          );
          any_deployed = true;
        }
        DeployOutcome::Noop => {}
      }
    }

    let version = synced
      .iter()
      .find_map(|repo| repo.matched_tag.clone())
      .or_else(|| {
        synced.first().map(|repo| repo.resolved_ref.clone())
      })
      .unwrap_or_else(|| String::from("unknown"));

    if any_deployed {
      self.set_phase(Phase::Notifying);
      notify::notify_deployed(&self.notifications, &version).await;
    }

    // Commit, all at once, only now that the orchestrator has
    // confirmed.
    self.state = DeployState {
      last_source_fp: Some(source_fp),
      last_images_fp: Some(images_fp),
      last_stack_digest: Some(output.digest),
      last_image_refs: output.images,
      last_ok_at: Some(agent_timestamp()),
      last_error: None,
      consecutive_failures: 0,
    };

    Ok(if any_deployed {
      CycleOutcome::Deployed { version }
    } else {
      CycleOutcome::AlreadyDeployed
    })
  }

  fn paths_for(&self, repo_id: &str) -> &[String] {
    self
      .repos
      .iter()
      .find(|repo| repo.config.id == repo_id)
      .map(|repo| repo.config.paths.as_slice())
      .unwrap_or(&[])
  }

  /// Syncs all watched repos concurrently and joins the results
  /// before evaluation.
  async fn observe(&self) -> Result<Vec<SyncedRepo>, CycleError> {
    let synced = join_all(
      self.repos.iter().map(|repo| self.sync_repo(repo)),
    )
    .await;
    synced.into_iter().collect()
  }

  async fn sync_repo(
    &self,
    repo: &RepoWatch,
  ) -> Result<SyncedRepo, CycleError> {
    self.check_cancel()?;
    let args = RepoSyncArgs {
      id: repo.config.id.clone(),
      url: repo.config.url.clone(),
      branch: repo.config.branch.clone(),
      username: repo.config.username.clone(),
      secret: repo.config.password.clone(),
    };
    let (res, _cloned) =
      git::pull_or_clone(&args, &self.repos_root)
        .await
        .map_err(CycleError::transient)?;
    if !all_logs_success(&res.logs) {
      return Err(CycleError::transient(anyhow!(
        "Failed to sync repo '{}' | {:?}",
        repo.config.id,
        res.logs,
      )));
    }
    let path = args.path(&self.repos_root);

    let mut matched_tag = None;
    if self.synced_via_tags
      && let Some(pattern) = &repo.tag_pattern
    {
      let (_, tag) = git::highest_matching_tag(&path, pattern)
        .await
        .map_err(CycleError::transient)?;
      if let Some(tag) = &tag {
        git::checkout_tag(&path, tag)
          .await
          .map_err(CycleError::transient)?;
      }
      matched_tag = tag;
    }

    // Resolve the ref after any tag checkout so the fingerprint
    // tracks what is actually staged.
    let (_, resolved_ref, _) = git::get_commit_hash_log(&path)
      .await
      .map_err(CycleError::transient)?;

    Ok(SyncedRepo {
      id: repo.config.id.clone(),
      path,
      resolved_ref,
      matched_tag,
      tag_pattern_configured: repo.tag_pattern.is_some(),
    })
  }
}

/// `polling_interval * min(2^failures, 16)`, clamped at 15
/// minutes.
pub fn backoff_interval(
  base: Duration,
  consecutive_failures: u32,
) -> Duration {
  let multiplier = 2u32
    .saturating_pow(consecutive_failures)
    .min(MAX_BACKOFF_MULTIPLIER);
  (base * multiplier).min(MAX_BACKOFF)
}

/// ±10% so multiple agents never fall into lockstep.
pub fn jittered(base: Duration) -> Duration {
  use rand::Rng;
  let factor = rand::rng().random_range(0.9..=1.1);
  base.mul_f64(factor)
}
