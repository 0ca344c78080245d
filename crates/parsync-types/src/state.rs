//! Ephemeral per-partition synchronization state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a partition currently stands in the sync cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStateKind {
    /// No unsynchronized local changes are known.
    UpToDate,
    /// A push or pull is currently running.
    SyncInProgress,
    /// Local changes are pending but the shared store is unreachable or
    /// the partition lease could not be obtained.
    OfflinePending,
    /// The last sync attempt failed; will retry on the next schedule.
    Error,
}

/// Snapshot of one partition's sync status, published to observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub kind: SyncStateKind,
    /// Count of unsynchronized change-log entries at publication time.
    pub pending: u64,
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SyncState {
    pub fn new(kind: SyncStateKind, pending: u64) -> Self {
        Self {
            kind,
            pending,
            last_error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(kind: SyncStateKind, pending: u64, error: impl Into<String>) -> Self {
        Self {
            kind,
            pending,
            last_error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(SyncStateKind::UpToDate, 0)
    }
}
