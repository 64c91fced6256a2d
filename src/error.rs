//! Error types for the turn relay

use crate::upstream::UpstreamError;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, RelayError>;

/// Turn relay error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Invalid conversation state: {0}")]
    InvalidState(String),

    #[error("No active subscription found or question limit reached")]
    QuotaDenied,

    #[error("Upstream failure: {0}")]
    UpstreamFailure(#[from] UpstreamError),

    #[error("Failed to persist history: {0}")]
    PersistenceFailure(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for RelayError {
    fn from(e: config::ConfigError) -> Self {
        RelayError::Config(e.to_string())
    }
}
