/// Everything that can abort a reconciliation cycle, tagged so the
/// reconciler can decide between retry, escalation, and unwind
/// without parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
  /// Network or filesystem trouble while observing sources.
  /// The cycle aborts and is retried with backoff.
  #[error("Transient IO error | {0:#}")]
  TransientIo(anyhow::Error),

  /// Recipe staging, subprocess, or stack file parse failure.
  /// Retried with backoff, though the operator usually must fix
  /// the recipe or the sources.
  #[error("Recipe failed | {0:#}")]
  RecipeFailed(anyhow::Error),

  /// The orchestrator answered with a 4xx.
  #[error("Orchestrator rejected the request | {0:#}")]
  OrchestratorRejected(anyhow::Error),

  /// Shutdown fired during the cycle. The cycle unwinds without
  /// mutating deployment state.
  #[error("Cycle cancelled by shutdown")]
  Cancelled,
}

impl CycleError {
  pub fn transient(e: impl Into<anyhow::Error>) -> CycleError {
    CycleError::TransientIo(e.into())
  }

  pub fn recipe(e: impl Into<anyhow::Error>) -> CycleError {
    CycleError::RecipeFailed(e.into())
  }
}
