use chrono::Utc;
use tracing::debug;

use parsync_store::DriverTransaction;
use parsync_types::Operation;

use crate::error::ChangeLogResult;

/// One tracked write session: a store transaction shared between the
/// caller's business mutations and the change-log entries shadowing them.
///
/// Dropping the session without [`ChangeSession::commit`] rolls back both
/// sides together, which is what keeps the log a gap-free shadow of the
/// applied mutations.
pub struct ChangeSession<'a> {
    txn: Box<dyn DriverTransaction + 'a>,
    recorded: usize,
}

impl<'a> ChangeSession<'a> {
    pub(crate) fn new(txn: Box<dyn DriverTransaction + 'a>) -> Self {
        Self { txn, recorded: 0 }
    }

    /// The underlying transaction, for the business writes themselves.
    pub fn transaction(&mut self) -> &mut (dyn DriverTransaction + 'a) {
        &mut *self.txn
    }

    /// Shadow one mutation. Timestamped at call time; the entry id is
    /// provisional until the session commits.
    pub fn record_change(
        &mut self,
        table: &str,
        record_id: &str,
        operation: Operation,
    ) -> ChangeLogResult<i64> {
        let id = self
            .txn
            .append_change(table, record_id, &operation, Utc::now())?;
        self.recorded += 1;
        debug!(table, record_id, %operation, id, "recorded change");
        Ok(id)
    }

    /// Number of changes recorded through this session so far.
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// Commit business writes and log entries atomically.
    pub fn commit(self) -> ChangeLogResult<()> {
        self.txn.commit()?;
        Ok(())
    }
}
