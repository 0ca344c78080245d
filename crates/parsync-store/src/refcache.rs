//! Process-wide cache of small reference tables.
//!
//! Reference data (currencies, categories, …) is read constantly by the
//! transformation layers and changes only on resync. The cache is
//! read-through with explicit `load()`/`invalidate()`: initialization is
//! guarded and idempotent, so concurrent first readers load the tables
//! exactly once instead of depending on static-initializer ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use parsync_types::Record;

use crate::error::StoreResult;
use crate::traits::TableDriver;

/// Read-through cache over a fixed set of reference tables.
pub struct ReferenceCache {
    driver: Arc<dyn TableDriver>,
    tables: Vec<String>,
    loaded: Mutex<Option<HashMap<String, Vec<Record>>>>,
}

impl ReferenceCache {
    pub fn new(driver: Arc<dyn TableDriver>, tables: impl IntoIterator<Item = String>) -> Self {
        Self {
            driver,
            tables: tables.into_iter().collect(),
            loaded: Mutex::new(None),
        }
    }

    /// Load every configured table now. Idempotent: a second call while
    /// loaded is a no-op, and concurrent callers serialize on the guard.
    pub fn load(&self) -> StoreResult<()> {
        let mut guard = self.loaded.lock().expect("lock poisoned");
        if guard.is_some() {
            return Ok(());
        }
        let mut data = HashMap::new();
        for table in &self.tables {
            let rows = self.driver.read_all(table)?;
            debug!(table = %table, rows = rows.len(), "loaded reference table");
            data.insert(table.clone(), rows);
        }
        info!(tables = self.tables.len(), "reference cache loaded");
        *guard = Some(data);
        Ok(())
    }

    /// Drop all cached rows; the next read reloads.
    pub fn invalidate(&self) {
        *self.loaded.lock().expect("lock poisoned") = None;
    }

    /// Rows of one reference table, loading on first use.
    pub fn get(&self, table: &str) -> StoreResult<Vec<Record>> {
        {
            let guard = self.loaded.lock().expect("lock poisoned");
            if let Some(data) = guard.as_ref() {
                return Ok(data.get(table).cloned().unwrap_or_default());
            }
        }
        self.load()?;
        let guard = self.loaded.lock().expect("lock poisoned");
        Ok(guard
            .as_ref()
            .and_then(|data| data.get(table))
            .cloned()
            .unwrap_or_default())
    }

    /// Whether the cache currently holds data.
    pub fn is_loaded(&self) -> bool {
        self.loaded.lock().expect("lock poisoned").is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDriver;
    use parsync_types::{ColumnInfo, TableSchema, TableValue};

    fn currencies_driver() -> Arc<MemoryDriver> {
        let driver = Arc::new(MemoryDriver::new("ref"));
        driver.create_table(TableSchema {
            table: "currencies".into(),
            columns: vec![
                ColumnInfo {
                    name: "code".into(),
                    declared_type: "TEXT".into(),
                    not_null: true,
                },
                ColumnInfo {
                    name: "name".into(),
                    declared_type: "TEXT".into(),
                    not_null: false,
                },
            ],
            primary_key: "code".into(),
        });
        driver
            .put_record(
                &Record::new("currencies", "code")
                    .with("code", TableValue::Text("EUR".into()))
                    .with("name", TableValue::Text("Euro".into())),
            )
            .unwrap();
        driver
    }

    #[test]
    fn read_through_and_invalidate() {
        let driver = currencies_driver();
        let cache = ReferenceCache::new(driver.clone(), vec!["currencies".to_string()]);

        assert!(!cache.is_loaded());
        let rows = cache.get("currencies").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(cache.is_loaded());

        // New rows appear only after invalidation.
        driver
            .put_record(
                &Record::new("currencies", "code")
                    .with("code", TableValue::Text("USD".into())),
            )
            .unwrap();
        assert_eq!(cache.get("currencies").unwrap().len(), 1);
        cache.invalidate();
        assert_eq!(cache.get("currencies").unwrap().len(), 2);
    }

    #[test]
    fn load_is_idempotent() {
        let cache = ReferenceCache::new(currencies_driver(), vec!["currencies".to_string()]);
        cache.load().unwrap();
        cache.load().unwrap();
        assert!(cache.is_loaded());
    }
}
