use std::time::Duration;

use thiserror::Error;

use parsync_types::PartitionId;

/// Errors from lease operations.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The wait budget elapsed without winning the lease.
    #[error("timed out acquiring lease for partition {partition} after {waited:?}")]
    Timeout {
        partition: PartitionId,
        waited: Duration,
    },

    /// Store failure. Failing to create the lease table is fatal to the
    /// caller; everything else surfaces here too.
    #[error("store error: {0}")]
    Store(#[from] parsync_store::StoreError),

    /// A blocking helper task died.
    #[error("lease task failed: {0}")]
    Task(String),
}

impl LeaseError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LeaseError::Timeout { .. })
    }
}

/// Result alias for lease operations.
pub type LeaseResult<T> = Result<T, LeaseError>;
