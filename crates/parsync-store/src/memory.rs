//! In-memory, HashMap-based table driver.
//!
//! Intended for tests and embedding. State is held behind a single mutex;
//! transactions clone the state, mutate the clone, and swap it back on
//! commit, which gives the same rollback-on-drop observable behavior as
//! the SQLite driver.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use parsync_types::{
    ChangeLogEntry, Lease, Operation, Record, TableSchema, TableValue, SOFT_DELETE_AT_COLUMN,
    SOFT_DELETE_COLUMN,
};

use crate::error::{StoreError, StoreResult};
use crate::traits::{DriverTransaction, TableDriver};

#[derive(Clone, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    changes: Vec<ChangeLogEntry>,
    next_change_id: i64,
    leases: Vec<Lease>,
}

#[derive(Clone)]
struct MemoryTable {
    schema: TableSchema,
    /// Rows keyed by the textual primary-key value.
    rows: BTreeMap<String, Record>,
}

/// In-memory [`TableDriver`] for tests.
pub struct MemoryDriver {
    name: String,
    state: Mutex<MemoryState>,
}

impl MemoryDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState {
                next_change_id: 1,
                ..MemoryState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Register a table. Test setup counterpart of external provisioning.
    pub fn create_table(&self, schema: TableSchema) {
        self.lock().tables.insert(
            schema.table.clone(),
            MemoryTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Put a row directly, bypassing transactions and the change log.
    pub fn put_record(&self, record: &Record) -> StoreResult<()> {
        let mut state = self.lock();
        let record_id = record_key(record)?;
        let table =
            state
                .tables
                .get_mut(&record.table)
                .ok_or_else(|| StoreError::MissingTable(record.table.clone()))?;
        table.rows.insert(record_id, record.clone());
        Ok(())
    }

    /// Number of rows currently in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }
}

fn record_key(record: &Record) -> StoreResult<String> {
    record.record_id().ok_or_else(|| StoreError::InvalidRecord {
        table: record.table.clone(),
        reason: "no primary-key value".into(),
    })
}

fn state_read_record(
    state: &MemoryState,
    table: &str,
    record_id: &str,
) -> StoreResult<Option<Record>> {
    let table = state
        .tables
        .get(table)
        .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
    Ok(table.rows.get(record_id).cloned())
}

impl TableDriver for MemoryDriver {
    fn location(&self) -> &str {
        &self.name
    }

    fn table_exists(&self, table: &str) -> StoreResult<bool> {
        Ok(self.lock().tables.contains_key(table))
    }

    fn table_schema(&self, table: &str) -> StoreResult<TableSchema> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.schema.clone())
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    fn invalidate_schema(&self, _table: Option<&str>) {
        // Schemas live with the tables themselves; nothing cached.
    }

    fn read_record(&self, table: &str, record_id: &str) -> StoreResult<Option<Record>> {
        state_read_record(&self.lock(), table, record_id)
    }

    fn read_all(&self, table: &str) -> StoreResult<Vec<Record>> {
        let state = self.lock();
        let table = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        Ok(table.rows.values().cloned().collect())
    }

    fn ensure_change_log(&self) -> StoreResult<()> {
        Ok(())
    }

    fn unsynchronized_changes(&self) -> StoreResult<Vec<ChangeLogEntry>> {
        let state = self.lock();
        Ok(state
            .changes
            .iter()
            .filter(|e| !e.synchronized)
            .cloned()
            .collect())
    }

    fn pending_changes(&self) -> StoreResult<u64> {
        let state = self.lock();
        Ok(state.changes.iter().filter(|e| !e.synchronized).count() as u64)
    }

    fn mark_synchronized(&self, ids: &[i64]) -> StoreResult<usize> {
        let mut state = self.lock();
        let mut changed = 0;
        for entry in state.changes.iter_mut() {
            if !entry.synchronized && ids.contains(&entry.id) {
                entry.synchronized = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn compact_changes(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.lock();
        let before = state.changes.len();
        state
            .changes
            .retain(|e| !(e.synchronized && e.timestamp_utc < cutoff));
        Ok(before - state.changes.len())
    }

    fn ensure_lease_table(&self) -> StoreResult<()> {
        Ok(())
    }

    fn active_lease(&self, now: DateTime<Utc>) -> StoreResult<Option<Lease>> {
        let state = self.lock();
        Ok(state
            .leases
            .iter()
            .filter(|l| !l.is_expired(now))
            .max_by_key(|l| l.expires_at)
            .cloned())
    }

    fn all_leases(&self) -> StoreResult<Vec<Lease>> {
        Ok(self.lock().leases.clone())
    }

    fn try_insert_lease(&self, lease: &Lease) -> StoreResult<bool> {
        let mut state = self.lock();
        if state.leases.iter().any(|l| !l.is_expired(lease.created_at)) {
            return Ok(false);
        }
        state.leases.push(lease.clone());
        Ok(true)
    }

    fn renew_lease(&self, lease_id: Uuid, expires_at: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.lock();
        match state.leases.iter_mut().find(|l| l.lease_id == lease_id) {
            Some(lease) => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_lease(&self, lease_id: Uuid) -> StoreResult<bool> {
        let mut state = self.lock();
        let before = state.leases.len();
        state.leases.retain(|l| l.lease_id != lease_id);
        Ok(state.leases.len() < before)
    }

    fn delete_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.lock();
        let before = state.leases.len();
        state.leases.retain(|l| !l.is_expired(now));
        Ok(before - state.leases.len())
    }

    fn begin(&self) -> StoreResult<Box<dyn DriverTransaction + '_>> {
        let snapshot = self.lock().clone();
        Ok(Box::new(MemoryTransaction {
            driver: self,
            state: snapshot,
            done: false,
        }))
    }
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDriver").field("name", &self.name).finish()
    }
}

/// Copy-on-write transaction over a [`MemoryDriver`].
struct MemoryTransaction<'a> {
    driver: &'a MemoryDriver,
    state: MemoryState,
    done: bool,
}

impl MemoryTransaction<'_> {
    fn table_mut(&mut self, table: &str) -> StoreResult<&mut MemoryTable> {
        self.state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }
}

impl DriverTransaction for MemoryTransaction<'_> {
    fn read_record(&mut self, table: &str, record_id: &str) -> StoreResult<Option<Record>> {
        state_read_record(&self.state, table, record_id)
    }

    fn insert_record(&mut self, record: &Record) -> StoreResult<()> {
        let record_id = record_key(record)?;
        let table = self.table_mut(&record.table)?;
        let schema = table.schema.clone();
        let mut row = record.clone();
        row.fields.retain(|name, _| schema.has_column(name));
        table.rows.insert(record_id, row);
        Ok(())
    }

    fn update_columns(&mut self, record: &Record, columns: &[String]) -> StoreResult<()> {
        let record_id = record_key(record)?;
        let table = self.table_mut(&record.table)?;
        let pk = table.schema.primary_key.clone();
        let schema = table.schema.clone();
        if let Some(row) = table.rows.get_mut(&record_id) {
            for column in columns {
                if *column == pk || !schema.has_column(column) {
                    continue;
                }
                if let Some(value) = record.fields.get(column) {
                    row.fields.insert(column.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    fn soft_delete(
        &mut self,
        table: &str,
        record_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let table_name = table.to_string();
        let table = self.table_mut(table)?;
        if !table.schema.supports_soft_delete() {
            return Err(StoreError::Schema {
                table: table_name,
                reason: format!("no {SOFT_DELETE_COLUMN} column"),
            });
        }
        let has_deleted_at = table.schema.has_column(SOFT_DELETE_AT_COLUMN);
        match table.rows.get_mut(record_id) {
            Some(row) => {
                row.fields
                    .insert(SOFT_DELETE_COLUMN.into(), TableValue::Bool(true));
                if has_deleted_at {
                    row.fields
                        .insert(SOFT_DELETE_AT_COLUMN.into(), TableValue::Timestamp(at));
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn hard_delete(&mut self, table: &str, record_id: &str) -> StoreResult<bool> {
        let table = self.table_mut(table)?;
        Ok(table.rows.remove(record_id).is_some())
    }

    fn append_change(
        &mut self,
        table: &str,
        record_id: &str,
        operation: &Operation,
        at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let id = self.state.next_change_id;
        self.state.next_change_id += 1;
        self.state.changes.push(ChangeLogEntry {
            id,
            table_name: table.to_string(),
            record_id: record_id.to_string(),
            operation: operation.clone(),
            timestamp_utc: at,
            synchronized: false,
        });
        Ok(id)
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.done = true;
        *self.driver.lock() = std::mem::take(&mut self.state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoices_schema() -> TableSchema {
        TableSchema {
            table: "invoices".into(),
            columns: ["id", "amount", "currency", "row_fingerprint", "deleted"]
                .iter()
                .map(|name| parsync_types::ColumnInfo {
                    name: (*name).to_string(),
                    declared_type: String::new(),
                    not_null: false,
                })
                .collect(),
            primary_key: "id".into(),
        }
    }

    fn invoice(amount: i64) -> Record {
        Record::new("invoices", "id")
            .with("id", TableValue::Integer(42))
            .with("amount", TableValue::Integer(amount))
    }

    #[test]
    fn transactions_roll_back_on_drop() {
        let driver = MemoryDriver::new("test");
        driver.create_table(invoices_schema());

        {
            let mut txn = driver.begin().unwrap();
            txn.insert_record(&invoice(100)).unwrap();
            txn.append_change("invoices", "42", &Operation::Insert, Utc::now())
                .unwrap();
            // No commit.
        }
        assert_eq!(driver.row_count("invoices"), 0);
        assert_eq!(driver.pending_changes().unwrap(), 0);

        let mut txn = driver.begin().unwrap();
        txn.insert_record(&invoice(100)).unwrap();
        txn.append_change("invoices", "42", &Operation::Insert, Utc::now())
            .unwrap();
        txn.commit().unwrap();
        assert_eq!(driver.row_count("invoices"), 1);
        assert_eq!(driver.pending_changes().unwrap(), 1);
    }

    #[test]
    fn lease_exclusivity_matches_sqlite_driver() {
        let driver = MemoryDriver::new("test");
        let lease = Lease::issue("push", "host-a", 1, std::time::Duration::from_secs(60));
        assert!(driver.try_insert_lease(&lease).unwrap());
        let rival = Lease::issue("push", "host-b", 2, std::time::Duration::from_secs(60));
        assert!(!driver.try_insert_lease(&rival).unwrap());
        assert!(driver.delete_lease(lease.lease_id).unwrap());
        assert!(driver.try_insert_lease(&rival).unwrap());
    }
}
