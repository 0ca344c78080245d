use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use parsync_store::TableDriver;
use parsync_types::ChangeLogEntry;

use crate::error::ChangeLogResult;
use crate::session::ChangeSession;

/// Append-only tracker of local mutations on one partition's local store.
///
/// Entries are created through a [`ChangeSession`] so they commit or roll
/// back together with the business write they describe. Entries are only
/// ever mutated false→true on `synchronized` and only leave the log through
/// explicit [`ChangeTracker::compact`].
pub struct ChangeTracker {
    driver: Arc<dyn TableDriver>,
}

impl ChangeTracker {
    /// Attach to a local store, creating the log table if needed.
    pub fn new(driver: Arc<dyn TableDriver>) -> ChangeLogResult<Self> {
        driver.ensure_change_log()?;
        Ok(Self { driver })
    }

    /// Begin a session: one store transaction shared by the caller's
    /// business writes and the log entries describing them.
    pub fn begin_session(&self) -> ChangeLogResult<ChangeSession<'_>> {
        let txn = self.driver.begin()?;
        Ok(ChangeSession::new(txn))
    }

    /// All entries awaiting push, ascending by id (causal order).
    pub fn unsynchronized(&self) -> ChangeLogResult<Vec<ChangeLogEntry>> {
        Ok(self.driver.unsynchronized_changes()?)
    }

    /// Count of entries awaiting push.
    pub fn pending_count(&self) -> ChangeLogResult<u64> {
        Ok(self.driver.pending_changes()?)
    }

    /// Mark entries as pushed. Idempotent.
    pub fn mark_synchronized(&self, ids: &[i64]) -> ChangeLogResult<usize> {
        let changed = self.driver.mark_synchronized(ids)?;
        debug!(requested = ids.len(), changed, "marked change entries synchronized");
        Ok(changed)
    }

    /// Delete synchronized entries older than the cutoff.
    pub fn compact(&self, older_than: DateTime<Utc>) -> ChangeLogResult<usize> {
        let deleted = self.driver.compact_changes(older_than)?;
        if deleted > 0 {
            info!(deleted, cutoff = %older_than, "compacted change log");
        }
        Ok(deleted)
    }
}
