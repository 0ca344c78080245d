use chrono::{DateTime, Utc};
use uuid::Uuid;

use parsync_types::{ChangeLogEntry, Lease, Operation, Record, TableSchema};

use crate::error::StoreResult;

/// The narrow surface the replication engine sees of a tabular store.
///
/// All implementations must satisfy these invariants:
/// - Reads of absent rows return `Ok(None)`, never an error. Errors mean a
///   genuine fault (I/O, corruption, schema), never "not found".
/// - `try_insert_lease` is atomic with respect to concurrent callers on
///   the same store: under any interleaving, at most one unexpired lease
///   row exists afterwards.
/// - Schema introspection is cached per table and refreshed only through
///   `invalidate_schema`.
/// - All I/O errors are propagated, never silently ignored.
pub trait TableDriver: Send + Sync {
    /// Human-readable location of this store (path or name), for logs.
    fn location(&self) -> &str;

    // ---- Schema introspection ----

    fn table_exists(&self, table: &str) -> StoreResult<bool>;

    /// Introspect a table's columns and primary key. Cached; the cache is
    /// filled lazily on first use.
    fn table_schema(&self, table: &str) -> StoreResult<TableSchema>;

    /// Drop the cached schema for one table (or all tables when `None`).
    fn invalidate_schema(&self, table: Option<&str>);

    // ---- Row access ----

    /// Read one row by its textual primary-key value.
    fn read_record(&self, table: &str, record_id: &str) -> StoreResult<Option<Record>>;

    /// Read every row of a table. Intended for small reference tables.
    fn read_all(&self, table: &str) -> StoreResult<Vec<Record>>;

    // ---- Change log ----

    /// Create the change-log table if it does not exist yet.
    fn ensure_change_log(&self) -> StoreResult<()>;

    /// All entries with `synchronized = false`, ascending by id.
    fn unsynchronized_changes(&self) -> StoreResult<Vec<ChangeLogEntry>>;

    /// Count of entries with `synchronized = false`.
    fn pending_changes(&self) -> StoreResult<u64>;

    /// Flip `synchronized` false→true for the given ids. Idempotent;
    /// returns the number of rows that actually changed.
    fn mark_synchronized(&self, ids: &[i64]) -> StoreResult<usize>;

    /// Delete synchronized entries older than the cutoff. The only way
    /// entries ever leave the log.
    fn compact_changes(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    // ---- Leases ----

    /// Create the lease table if it does not exist yet.
    fn ensure_lease_table(&self) -> StoreResult<()>;

    /// The unexpired lease at `now`, if any.
    fn active_lease(&self, now: DateTime<Utc>) -> StoreResult<Option<Lease>>;

    /// Every lease row, expired or not.
    fn all_leases(&self) -> StoreResult<Vec<Lease>>;

    /// Insert `lease` if and only if no unexpired lease row exists at its
    /// creation instant. Returns `false` when another holder won the race.
    fn try_insert_lease(&self, lease: &Lease) -> StoreResult<bool>;

    /// Move a lease's expiry forward. Returns `false` if the row is gone.
    fn renew_lease(&self, lease_id: Uuid, expires_at: DateTime<Utc>) -> StoreResult<bool>;

    /// Delete a lease row. Returns `false` if the row was already gone.
    fn delete_lease(&self, lease_id: Uuid) -> StoreResult<bool>;

    /// Delete every lease row whose expiry has passed.
    fn delete_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    // ---- Transactions ----

    /// Begin a write transaction. Dropping the returned handle without
    /// calling `commit` rolls everything back.
    fn begin(&self) -> StoreResult<Box<dyn DriverTransaction + '_>>;
}

/// One open write transaction against a [`TableDriver`].
///
/// Rollback-on-drop: a transaction that is not committed leaves the store
/// untouched, including any change-log entries appended through it. That is
/// what makes the change log fail-atomic with the business mutation it
/// describes.
///
/// Handles are not `Send`: a transaction lives and dies on the thread that
/// opened it (the engine runs whole transactional phases inside one
/// blocking task).
pub trait DriverTransaction {
    /// Read one row inside the transaction.
    fn read_record(&mut self, table: &str, record_id: &str) -> StoreResult<Option<Record>>;

    /// Insert a full row.
    fn insert_record(&mut self, record: &Record) -> StoreResult<()>;

    /// Update only the named columns of an existing row.
    fn update_columns(&mut self, record: &Record, columns: &[String]) -> StoreResult<()>;

    /// Mark a row soft-deleted. Errors if the table has no soft-delete
    /// column; returns `false` if the row does not exist.
    fn soft_delete(&mut self, table: &str, record_id: &str, at: DateTime<Utc>)
        -> StoreResult<bool>;

    /// Physically delete a row. Returns `false` if the row does not exist.
    fn hard_delete(&mut self, table: &str, record_id: &str) -> StoreResult<bool>;

    /// Append a change-log entry describing a mutation made in this same
    /// transaction. Returns the new entry's id.
    fn append_change(
        &mut self,
        table: &str,
        record_id: &str,
        operation: &Operation,
        at: DateTime<Utc>,
    ) -> StoreResult<i64>;

    /// Commit everything done through this handle.
    fn commit(self: Box<Self>) -> StoreResult<()>;
}
