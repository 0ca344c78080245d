//! Open-by-name access to partition stores.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use parsync_store::{SqliteDriver, StoreResult, TableDriver};
use parsync_types::PartitionId;

use crate::config::EngineConfig;

/// Resolves a partition to its local and shared store drivers.
///
/// Opening the shared store of a disconnected client is *expected* to
/// fail; callers treat that as offline-pending, not as an error.
pub trait StoreOpener: Send + Sync {
    fn open_local(&self, partition: &PartitionId) -> StoreResult<Arc<dyn TableDriver>>;
    fn open_shared(&self, partition: &PartitionId) -> StoreResult<Arc<dyn TableDriver>>;
}

/// Production opener: SQLite stores at the configured locations.
pub struct SqliteOpener {
    config: EngineConfig,
}

impl SqliteOpener {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl StoreOpener for SqliteOpener {
    fn open_local(&self, partition: &PartitionId) -> StoreResult<Arc<dyn TableDriver>> {
        let locations = self.config.locations(partition);
        Ok(Arc::new(SqliteDriver::open_local(locations.local_path)?))
    }

    fn open_shared(&self, partition: &PartitionId) -> StoreResult<Arc<dyn TableDriver>> {
        let locations = self.config.locations(partition);
        Ok(Arc::new(SqliteDriver::open_shared(locations.shared_path)?))
    }
}

/// Opener over pre-built drivers, for tests and embedding.
///
/// A partition registered without a shared driver simulates an
/// unreachable network volume: `open_shared` fails the way the SQLite
/// opener does on a missing file.
#[derive(Default)]
pub struct StaticOpener {
    #[allow(clippy::type_complexity)]
    stores: Mutex<HashMap<PartitionId, (Arc<dyn TableDriver>, Option<Arc<dyn TableDriver>>)>>,
}

impl StaticOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        partition: PartitionId,
        local: Arc<dyn TableDriver>,
        shared: Option<Arc<dyn TableDriver>>,
    ) {
        self.stores
            .lock()
            .expect("lock poisoned")
            .insert(partition, (local, shared));
    }

    fn unreachable(partition: &PartitionId) -> parsync_store::StoreError {
        parsync_store::StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no store registered for partition {partition}"),
        ))
    }
}

impl StoreOpener for StaticOpener {
    fn open_local(&self, partition: &PartitionId) -> StoreResult<Arc<dyn TableDriver>> {
        self.stores
            .lock()
            .expect("lock poisoned")
            .get(partition)
            .map(|(local, _)| local.clone())
            .ok_or_else(|| Self::unreachable(partition))
    }

    fn open_shared(&self, partition: &PartitionId) -> StoreResult<Arc<dyn TableDriver>> {
        self.stores
            .lock()
            .expect("lock poisoned")
            .get(partition)
            .and_then(|(_, shared)| shared.clone())
            .ok_or_else(|| Self::unreachable(partition))
    }
}
