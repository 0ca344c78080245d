use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid partition id {id:?}: {reason}")]
    InvalidPartition { id: String, reason: String },

    #[error("invalid operation encoding: {0:?}")]
    InvalidOperation(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Result alias for type operations.
pub type Result<T> = std::result::Result<T, TypeError>;
