//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while checking or running jobs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error(transparent)]
    Orchestrator(#[from] dockup_rollout::OrchestratorError),

    #[error("state store error: {0}")]
    State(#[from] dockup_state::StateError),

    #[error("runtime error: {0}")]
    Runtime(#[from] dockup_runtime::RuntimeError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
