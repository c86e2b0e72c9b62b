//! Error types for adalloc-engine

use thiserror::Error;

/// Error type for allocation engine operations
#[derive(Debug, Error)]
pub enum AllocError {
    /// Input rejected before any state was touched
    #[error("Validation error: {0}")]
    Validation(String),

    /// Variant or registry entry does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage failure that is worth retrying
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    /// Storage failure that retrying will not fix
    #[error("Storage error: {0}")]
    Storage(String),

    /// Registry stage change not allowed by the lifecycle
    #[error("Invalid transition for {artifact}: {from} -> {to}")]
    InvalidTransition {
        artifact: String,
        from: String,
        to: String,
    },

    /// Long-running job stopped through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Background task is no longer running
    #[error("Engine is shut down: {0}")]
    Shutdown(String),

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AllocError {
    /// Whether the persistence layer should retry the failed operation
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorage(_))
    }
}

impl From<serde_json::Error> for AllocError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for allocation engine operations
pub type Result<T> = std::result::Result<T, AllocError>;
