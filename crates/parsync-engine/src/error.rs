use thiserror::Error;

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] parsync_store::StoreError),

    #[error("change log error: {0}")]
    ChangeLog(#[from] parsync_changelog::ChangeLogError),

    #[error("lease error: {0}")]
    Lease(#[from] parsync_lease::LeaseError),

    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking helper task died.
    #[error("engine task failed: {0}")]
    Task(String),
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
