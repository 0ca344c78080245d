use thiserror::Error;

/// Errors from change-tracking operations.
#[derive(Debug, Error)]
pub enum ChangeLogError {
    #[error("store error: {0}")]
    Store(#[from] parsync_store::StoreError),
}

/// Result alias for change-tracking operations.
pub type ChangeLogResult<T> = Result<T, ChangeLogError>;
