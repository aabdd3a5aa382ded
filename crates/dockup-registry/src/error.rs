//! Error types for registry queries and version parsing.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised while listing tags. Always scoped to one image.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid image reference: {0}")]
    Reference(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("registry returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("failed to decode registry response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RegistryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RegistryError::Decode(e.to_string())
        } else {
            RegistryError::Network(e.to_string())
        }
    }
}

/// The running tag does not look like a version, so no update can be suggested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("tag {0:?} is not a recognizable version")]
    Unparseable(String),
}
