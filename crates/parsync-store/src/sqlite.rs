//! SQLite driver: the production [`TableDriver`] implementation.
//!
//! One connection per driver, serialized behind a mutex. The local copy of
//! a partition store runs with WAL journaling; the shared copy on the
//! network volume stays on the default rollback journal, which behaves
//! better on SMB/NFS mounts.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};
use uuid::Uuid;

use parsync_types::{
    ChangeLogEntry, ColumnInfo, Lease, LeaseStatus, Operation, Record, TableSchema, TypeError,
    SOFT_DELETE_AT_COLUMN, SOFT_DELETE_COLUMN,
};

use crate::error::{StoreError, StoreResult};
use crate::traits::{DriverTransaction, TableDriver};

/// Name of the change-log table.
pub const CHANGE_LOG_TABLE: &str = "change_log";
/// Name of the lease table.
pub const LEASE_TABLE: &str = "sync_lease";

const CREATE_CHANGE_LOG: &str = "\
CREATE TABLE IF NOT EXISTS change_log (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  table_name    TEXT NOT NULL,
  record_id     TEXT NOT NULL,
  operation     TEXT NOT NULL,
  timestamp_utc TEXT NOT NULL,
  synchronized  INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_change_log_pending
  ON change_log (synchronized, id);";

const CREATE_LEASE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS sync_lease (
  lease_id   TEXT PRIMARY KEY,
  reason     TEXT NOT NULL,
  created_at TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  owner_host TEXT NOT NULL,
  owner_pid  INTEGER NOT NULL,
  status     TEXT NOT NULL
);";

/// Render a timestamp the way every parsync table stores it: RFC 3339 UTC
/// with millisecond precision. The fixed width makes lexicographic and
/// chronological order agree, so expiry comparisons can run in SQL.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Type(TypeError::InvalidTimestamp(format!("{raw:?}: {e}"))))
}

fn value_to_sql(value: &parsync_types::TableValue) -> Value {
    use parsync_types::TableValue::*;
    match value {
        Null => Value::Null,
        Integer(v) => Value::Integer(*v),
        Real(v) => Value::Real(*v),
        Text(v) => Value::Text(v.clone()),
        Bool(v) => Value::Integer(i64::from(*v)),
        Timestamp(v) => Value::Text(fmt_ts(*v)),
        Blob(v) => Value::Blob(v.clone()),
    }
}

fn value_from_ref(value: ValueRef<'_>) -> StoreResult<parsync_types::TableValue> {
    use parsync_types::TableValue;
    Ok(match value {
        ValueRef::Null => TableValue::Null,
        ValueRef::Integer(v) => TableValue::Integer(v),
        ValueRef::Real(v) => TableValue::Real(v),
        ValueRef::Text(v) => TableValue::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => TableValue::Blob(v.to_vec()),
    })
}

/// Quote an identifier for embedding in SQL.
fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// SQLite-backed [`TableDriver`].
pub struct SqliteDriver {
    path: String,
    conn: Mutex<Connection>,
    schemas: RwLock<HashMap<String, TableSchema>>,
}

impl SqliteDriver {
    /// Open an existing store with WAL journaling (the local copy).
    ///
    /// The file must already exist: store provisioning is somebody else's
    /// job, and silently creating an empty store would mask a missing or
    /// unreachable location.
    pub fn open_local(path: impl AsRef<Path>) -> StoreResult<Self> {
        let driver = Self::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        {
            let conn = driver.lock_conn();
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        Ok(driver)
    }

    /// Open an existing store with the default rollback journal (the
    /// shared copy on the network volume).
    pub fn open_shared(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
    }

    /// Open a store, creating the file when absent. Used by provisioning
    /// and tests, never by the sync paths.
    pub fn create(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
    }

    fn open_with_flags(path: impl AsRef<Path>, flags: OpenFlags) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        debug!(path = %path.display(), "opened sqlite store");
        Ok(Self {
            path: path.display().to_string(),
            conn: Mutex::new(conn),
            schemas: RwLock::new(HashMap::new()),
        })
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("lock poisoned")
    }

    /// Run a batch of raw statements. Provisioning/test escape hatch.
    pub fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        self.lock_conn().execute_batch(sql)?;
        Ok(())
    }

    /// Introspect (or fetch from cache) a table schema using an
    /// already-held connection.
    fn schema_locked(&self, conn: &Connection, table: &str) -> StoreResult<TableSchema> {
        if let Some(schema) = self.schemas.read().expect("lock poisoned").get(table) {
            return Ok(schema.clone());
        }

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let mut rows = stmt.query([])?;
        let mut columns = Vec::new();
        let mut primary_key: Option<String> = None;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            let declared_type: String = row.get(2)?;
            let not_null: bool = row.get::<_, i64>(3)? != 0;
            let pk: i64 = row.get(5)?;
            if pk == 1 {
                primary_key = Some(name.clone());
            }
            columns.push(ColumnInfo {
                name,
                declared_type,
                not_null,
            });
        }
        if columns.is_empty() {
            return Err(StoreError::MissingTable(table.to_string()));
        }
        let primary_key = primary_key.ok_or_else(|| StoreError::Schema {
            table: table.to_string(),
            reason: "no primary-key column".into(),
        })?;

        let schema = TableSchema {
            table: table.to_string(),
            columns,
            primary_key,
        };
        self.schemas
            .write()
            .expect("lock poisoned")
            .insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    fn read_record_with(
        &self,
        conn: &Connection,
        table: &str,
        record_id: &str,
    ) -> StoreResult<Option<Record>> {
        let schema = self.schema_locked(conn, table)?;
        let cols: Vec<String> = schema.column_names().map(quote).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE CAST({} AS TEXT) = ?1",
            cols.join(", "),
            quote(table),
            quote(&schema.primary_key),
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([record_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row_to_record(&schema, row)?))
    }
}

fn row_to_record(schema: &TableSchema, row: &rusqlite::Row<'_>) -> StoreResult<Record> {
    let mut fields = BTreeMap::new();
    for (i, col) in schema.columns.iter().enumerate() {
        fields.insert(col.name.clone(), value_from_ref(row.get_ref(i)?)?);
    }
    Ok(Record {
        table: schema.table.clone(),
        primary_key: schema.primary_key.clone(),
        fields,
    })
}

fn lease_from_row(row: &rusqlite::Row<'_>) -> StoreResult<Lease> {
    let lease_id: String = row.get(0)?;
    let lease_id = Uuid::parse_str(&lease_id).map_err(|e| StoreError::InvalidRecord {
        table: LEASE_TABLE.to_string(),
        reason: format!("bad lease id {lease_id:?}: {e}"),
    })?;
    Ok(Lease {
        lease_id,
        reason: row.get(1)?,
        created_at: parse_ts(&row.get::<_, String>(2)?)?,
        expires_at: parse_ts(&row.get::<_, String>(3)?)?,
        owner_host: row.get(4)?,
        owner_pid: row.get::<_, i64>(5)? as u32,
        status: LeaseStatus::Active,
    })
}

const LEASE_COLUMNS: &str = "lease_id, reason, created_at, expires_at, owner_host, owner_pid";

impl TableDriver for SqliteDriver {
    fn location(&self) -> &str {
        &self.path
    }

    fn table_exists(&self, table: &str) -> StoreResult<bool> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
        Ok(stmt.exists([table])?)
    }

    fn table_schema(&self, table: &str) -> StoreResult<TableSchema> {
        let conn = self.lock_conn();
        self.schema_locked(&conn, table)
    }

    fn invalidate_schema(&self, table: Option<&str>) {
        let mut schemas = self.schemas.write().expect("lock poisoned");
        match table {
            Some(table) => {
                schemas.remove(table);
            }
            None => schemas.clear(),
        }
    }

    fn read_record(&self, table: &str, record_id: &str) -> StoreResult<Option<Record>> {
        let conn = self.lock_conn();
        self.read_record_with(&conn, table, record_id)
    }

    fn read_all(&self, table: &str) -> StoreResult<Vec<Record>> {
        let conn = self.lock_conn();
        let schema = self.schema_locked(&conn, table)?;
        let cols: Vec<String> = schema.column_names().map(quote).collect();
        let sql = format!("SELECT {} FROM {}", cols.join(", "), quote(table));
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(&schema, row)?);
        }
        Ok(records)
    }

    fn ensure_change_log(&self) -> StoreResult<()> {
        self.lock_conn().execute_batch(CREATE_CHANGE_LOG)?;
        Ok(())
    }

    fn unsynchronized_changes(&self) -> StoreResult<Vec<ChangeLogEntry>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, table_name, record_id, operation, timestamp_utc
             FROM change_log WHERE synchronized = 0 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let operation: String = row.get(3)?;
            let operation: Operation = operation.parse().map_err(StoreError::Type)?;
            entries.push(ChangeLogEntry {
                id: row.get(0)?,
                table_name: row.get(1)?,
                record_id: row.get(2)?,
                operation,
                timestamp_utc: parse_ts(&row.get::<_, String>(4)?)?,
                synchronized: false,
            });
        }
        Ok(entries)
    }

    fn pending_changes(&self) -> StoreResult<u64> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM change_log WHERE synchronized = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn mark_synchronized(&self, ids: &[i64]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.lock_conn();
        let mut changed = 0;
        // SQLite caps bound parameters per statement; chunking keeps us
        // far below the limit.
        for chunk in ids.chunks(500) {
            let placeholders: Vec<String> =
                (1..=chunk.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "UPDATE change_log SET synchronized = 1
                 WHERE synchronized = 0 AND id IN ({})",
                placeholders.join(", ")
            );
            changed += conn.execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
        }
        Ok(changed)
    }

    fn compact_changes(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.lock_conn();
        let deleted = conn.execute(
            "DELETE FROM change_log WHERE synchronized = 1 AND timestamp_utc < ?1",
            [fmt_ts(cutoff)],
        )?;
        Ok(deleted)
    }

    fn ensure_lease_table(&self) -> StoreResult<()> {
        self.lock_conn().execute_batch(CREATE_LEASE_TABLE)?;
        Ok(())
    }

    fn active_lease(&self, now: DateTime<Utc>) -> StoreResult<Option<Lease>> {
        let conn = self.lock_conn();
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM sync_lease
             WHERE expires_at > ?1 ORDER BY expires_at DESC LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([fmt_ts(now)])?;
        match rows.next()? {
            Some(row) => Ok(Some(lease_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn all_leases(&self) -> StoreResult<Vec<Lease>> {
        let conn = self.lock_conn();
        let sql = format!("SELECT {LEASE_COLUMNS} FROM sync_lease ORDER BY created_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut leases = Vec::new();
        while let Some(row) = rows.next()? {
            leases.push(lease_from_row(row)?);
        }
        Ok(leases)
    }

    fn try_insert_lease(&self, lease: &Lease) -> StoreResult<bool> {
        let conn = self.lock_conn();
        // IMMEDIATE takes the write lock up front so the existence check
        // and the insert are one atomic step across processes.
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = (|| -> StoreResult<bool> {
            let unexpired: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_lease WHERE expires_at > ?1",
                [fmt_ts(lease.created_at)],
                |row| row.get(0),
            )?;
            if unexpired > 0 {
                return Ok(false);
            }
            conn.execute(
                "INSERT INTO sync_lease
                   (lease_id, reason, created_at, expires_at, owner_host, owner_pid, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'ACTIVE')",
                rusqlite::params![
                    lease.lease_id.to_string(),
                    lease.reason,
                    fmt_ts(lease.created_at),
                    fmt_ts(lease.expires_at),
                    lease.owner_host,
                    i64::from(lease.owner_pid),
                ],
            )?;
            Ok(true)
        })();
        match &result {
            Ok(true) => conn.execute_batch("COMMIT")?,
            _ => {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %e, "lease insert rollback failed");
                }
            }
        }
        result
    }

    fn renew_lease(&self, lease_id: Uuid, expires_at: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE sync_lease SET expires_at = ?1 WHERE lease_id = ?2",
            rusqlite::params![fmt_ts(expires_at), lease_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn delete_lease(&self, lease_id: Uuid) -> StoreResult<bool> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "DELETE FROM sync_lease WHERE lease_id = ?1",
            [lease_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn delete_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.lock_conn();
        let deleted = conn.execute(
            "DELETE FROM sync_lease WHERE expires_at <= ?1",
            [fmt_ts(now)],
        )?;
        Ok(deleted)
    }

    fn begin(&self) -> StoreResult<Box<dyn DriverTransaction + '_>> {
        let conn = self.lock_conn();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction {
            driver: self,
            conn,
            done: false,
        }))
    }
}

impl std::fmt::Debug for SqliteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDriver").field("path", &self.path).finish()
    }
}

/// One open `BEGIN IMMEDIATE` transaction. Rolls back on drop.
struct SqliteTransaction<'a> {
    driver: &'a SqliteDriver,
    conn: MutexGuard<'a, Connection>,
    done: bool,
}

impl SqliteTransaction<'_> {
    fn schema(&self, table: &str) -> StoreResult<TableSchema> {
        self.driver.schema_locked(&self.conn, table)
    }
}

impl DriverTransaction for SqliteTransaction<'_> {
    fn read_record(&mut self, table: &str, record_id: &str) -> StoreResult<Option<Record>> {
        self.driver.read_record_with(&self.conn, table, record_id)
    }

    fn insert_record(&mut self, record: &Record) -> StoreResult<()> {
        let schema = self.schema(&record.table)?;
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (name, value) in &record.fields {
            if schema.has_column(name) {
                names.push(quote(name));
                values.push(value_to_sql(value));
            }
        }
        if names.is_empty() {
            return Err(StoreError::InvalidRecord {
                table: record.table.clone(),
                reason: "no columns to insert".into(),
            });
        }
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&record.table),
            names.join(", "),
            placeholders.join(", "),
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(())
    }

    fn update_columns(&mut self, record: &Record, columns: &[String]) -> StoreResult<()> {
        let schema = self.schema(&record.table)?;
        let record_id = record
            .record_id()
            .ok_or_else(|| StoreError::InvalidRecord {
                table: record.table.clone(),
                reason: "no primary-key value".into(),
            })?;

        let mut assignments = Vec::new();
        let mut values = Vec::new();
        for column in columns {
            if *column == schema.primary_key || !schema.has_column(column) {
                continue;
            }
            let Some(value) = record.fields.get(column) else {
                continue;
            };
            assignments.push(format!("{} = ?{}", quote(column), assignments.len() + 1));
            values.push(value_to_sql(value));
        }
        if assignments.is_empty() {
            return Ok(());
        }
        values.push(Value::Text(record_id));
        let sql = format!(
            "UPDATE {} SET {} WHERE CAST({} AS TEXT) = ?{}",
            quote(&record.table),
            assignments.join(", "),
            quote(&schema.primary_key),
            values.len(),
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(())
    }

    fn soft_delete(
        &mut self,
        table: &str,
        record_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let schema = self.schema(table)?;
        if !schema.supports_soft_delete() {
            return Err(StoreError::Schema {
                table: table.to_string(),
                reason: format!("no {SOFT_DELETE_COLUMN} column"),
            });
        }
        let changed = if schema.has_column(SOFT_DELETE_AT_COLUMN) {
            let sql = format!(
                "UPDATE {} SET {} = 1, {} = ?1 WHERE CAST({} AS TEXT) = ?2",
                quote(table),
                quote(SOFT_DELETE_COLUMN),
                quote(SOFT_DELETE_AT_COLUMN),
                quote(&schema.primary_key),
            );
            self.conn
                .execute(&sql, rusqlite::params![fmt_ts(at), record_id])?
        } else {
            let sql = format!(
                "UPDATE {} SET {} = 1 WHERE CAST({} AS TEXT) = ?1",
                quote(table),
                quote(SOFT_DELETE_COLUMN),
                quote(&schema.primary_key),
            );
            self.conn.execute(&sql, [record_id])?
        };
        Ok(changed > 0)
    }

    fn hard_delete(&mut self, table: &str, record_id: &str) -> StoreResult<bool> {
        let schema = self.schema(table)?;
        let sql = format!(
            "DELETE FROM {} WHERE CAST({} AS TEXT) = ?1",
            quote(table),
            quote(&schema.primary_key),
        );
        let changed = self.conn.execute(&sql, [record_id])?;
        Ok(changed > 0)
    }

    fn append_change(
        &mut self,
        table: &str,
        record_id: &str,
        operation: &Operation,
        at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        self.conn.execute(
            "INSERT INTO change_log (table_name, record_id, operation, timestamp_utc, synchronized)
             VALUES (?1, ?2, ?3, ?4, 0)",
            rusqlite::params![table, record_id, operation.encode(), fmt_ts(at)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.done = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "transaction rollback failed");
            }
        }
    }
}
