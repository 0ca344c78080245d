use thiserror::Error;

/// Errors from tabular store operations.
///
/// Missing rows are not errors: reads return `Ok(None)`. The variants here
/// split into three behavioral classes the engine cares about:
/// transient (retry), integrity (skip the single entry), and fatal
/// (roll back the batch). See [`StoreError::is_transient`] and
/// [`StoreError::is_integrity`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The named table does not exist in this store.
    #[error("table not found: {0}")]
    MissingTable(String),

    /// The table exists but does not have the shape an operation needs.
    #[error("schema mismatch on {table}: {reason}")]
    Schema { table: String, reason: String },

    /// The record being written is malformed (no primary-key value, empty
    /// column set, ...).
    #[error("invalid record for {table}: {reason}")]
    InvalidRecord { table: String, reason: String },

    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error from the storage location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value or identifier error.
    #[error("type error: {0}")]
    Type(#[from] parsync_types::TypeError),
}

impl StoreError {
    /// Lock contention and friends: safe to retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Row-level integrity problems: skip the affected entry, keep the
    /// batch going.
    pub fn is_integrity(&self) -> bool {
        match self {
            StoreError::MissingTable(_)
            | StoreError::Schema { .. }
            | StoreError::InvalidRecord { .. } => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
