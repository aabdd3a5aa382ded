//! Container runtime errors.

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container or image not found: {0}")]
    NotFound(String),

    #[error("pull failed: {0}")]
    Pull(String),

    #[error("create failed: {0}")]
    Create(String),

    #[error("start failed: {0}")]
    Start(String),

    #[error("stop failed: {0}")]
    Stop(String),

    #[error("remove failed: {0}")]
    Remove(String),

    #[error("inspect failed: {0}")]
    Inspect(String),

    #[error("container runtime unavailable: {0}")]
    Connect(String),
}

impl RuntimeError {
    /// Map a Docker API error, turning 404 responses into [`RuntimeError::NotFound`].
    pub(crate) fn from_docker(
        e: bollard::errors::Error,
        target: &str,
        wrap: fn(String) -> RuntimeError,
    ) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::NotFound(target.to_string()),
            other => wrap(format!("{target}: {other}")),
        }
    }
}
