//! Error types for update orchestration.

use std::path::PathBuf;

use thiserror::Error;

use dockup_runtime::RuntimeError;
use dockup_state::StateError;

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced by [`Orchestrator`](crate::Orchestrator) operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("an operation is already in progress for {0}")]
    OperationInProgress(String),

    #[error("container {0} not found")]
    ContainerNotFound(String),

    #[error("container {0} is not monitored")]
    NotMonitored(String),

    #[error("{container} is already running {tag}")]
    AlreadyAtTag { container: String, tag: String },

    #[error("no previous version recorded for {0}")]
    NoPreviousVersion(String),

    /// Pull failed; the running container was not touched.
    #[error("pull of {image} failed: {message}")]
    Pull { image: String, message: String },

    /// Recreate failed and the original container was restored.
    #[error("recreate of {container} failed, original restored: {message}")]
    Recreate { container: String, message: String },

    /// Recreate failed and restoring the original failed too.
    #[error("MANUAL INTERVENTION REQUIRED: {container} could not be restored: {message}")]
    RecoveryFailed { container: String, message: String },

    /// Health gate failed and the automatic revert did not come back healthy.
    #[error("MANUAL INTERVENTION REQUIRED: revert of {container} failed: {message}")]
    RevertFailed { container: String, message: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl OrchestratorError {
    /// Whether the container may be left in a state needing an operator.
    pub fn needs_intervention(&self) -> bool {
        matches!(
            self,
            Self::RecoveryFailed { .. } | Self::RevertFailed { .. }
        )
    }
}

/// Errors from editing compose and env files.
#[derive(Debug, Error)]
pub enum FileEditError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("variable {var} not found in {path}")]
    VariableNotFound { var: String, path: PathBuf },

    #[error("service {service} not found in {path}")]
    ServiceNotFound { service: String, path: PathBuf },

    #[error("service {service} has no image in {path}")]
    ImageNotFound { service: String, path: PathBuf },
}

/// Errors from delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("notification endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
}
