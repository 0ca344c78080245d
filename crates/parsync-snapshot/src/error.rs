use std::path::PathBuf;

use thiserror::Error;

use parsync_types::PartitionId;

/// Errors from snapshot replication.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The partition still has unsynchronized change-log entries.
    /// Replacing either copy now would discard un-pushed edits.
    #[error("partition {partition} has {count} unsynchronized changes; push before replicating")]
    PendingChanges { partition: PartitionId, count: u64 },

    /// The file to copy from does not exist.
    #[error("snapshot source missing: {0}")]
    SourceMissing(PathBuf),

    /// A compressed snapshot does not match its manifest checksum.
    #[error("snapshot checksum mismatch: {0}")]
    ChecksumMismatch(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest (de)serialization failure.
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// Store access while checking the pending guard.
    #[error("store error: {0}")]
    Store(#[from] parsync_store::StoreError),

    /// A blocking helper task died.
    #[error("snapshot task failed: {0}")]
    Task(String),
}

/// Result alias for snapshot operations.
pub type SnapshotResult<T> = Result<T, SnapshotError>;
