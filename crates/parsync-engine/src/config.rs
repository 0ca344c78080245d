//! Engine configuration.
//!
//! Store locations and timing knobs are supplied externally (a TOML file
//! in the application's profile directory); the engine itself never
//! decides where a partition lives.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use parsync_types::PartitionId;

use crate::error::{EngineError, EngineResult};

/// Local/shared store pair of one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLocations {
    pub local_path: PathBuf,
    pub shared_path: PathBuf,
}

/// Engine-wide configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding local partition stores (`<root>/<PARTITION>.db`).
    pub local_root: PathBuf,
    /// Network directory holding the shared stores.
    pub shared_root: PathBuf,
    /// Per-partition overrides of the derived locations.
    pub partitions: BTreeMap<String, PartitionLocations>,
    /// How long an acquired partition lease lives without renewal.
    pub lease_duration_secs: u64,
    /// How long a push waits for the partition lease before reporting
    /// offline-pending.
    pub lease_wait_secs: u64,
    /// Minimum spacing between scheduled pushes of one partition.
    pub push_cooldown_secs: u64,
    /// A push running longer than this is logged by the watchdog.
    pub push_warn_after_secs: u64,
    /// Synchronized change-log entries older than this are eligible for
    /// compaction.
    pub compact_keep_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from("data"),
            shared_root: PathBuf::from("shared"),
            partitions: BTreeMap::new(),
            lease_duration_secs: 180,
            lease_wait_secs: 5,
            push_cooldown_secs: 30,
            push_warn_after_secs: 60,
            compact_keep_days: 30,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    /// Store locations for a partition: the explicit override when
    /// configured, otherwise `<root>/<PARTITION>.db` under both roots.
    pub fn locations(&self, partition: &PartitionId) -> PartitionLocations {
        if let Some(locations) = self.partitions.get(partition.as_str()) {
            return locations.clone();
        }
        let file = format!("{partition}.db");
        PartitionLocations {
            local_path: self.local_root.join(&file),
            shared_path: self.shared_root.join(&file),
        }
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_secs(self.lease_wait_secs)
    }

    pub fn push_cooldown(&self) -> Duration {
        Duration::from_secs(self.push_cooldown_secs)
    }

    pub fn push_warn_after(&self) -> Duration {
        Duration::from_secs(self.push_warn_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_locations_from_roots() {
        let config = EngineConfig::default();
        let es = config.locations(&PartitionId::new("ES").unwrap());
        assert_eq!(es.local_path, PathBuf::from("data/ES.db"));
        assert_eq!(es.shared_path, PathBuf::from("shared/ES.db"));
    }

    #[test]
    fn overrides_win() {
        let mut config = EngineConfig::default();
        config.partitions.insert(
            "DE".into(),
            PartitionLocations {
                local_path: "/elsewhere/de.db".into(),
                shared_path: "/mnt/share/de.db".into(),
            },
        );
        let de = config.locations(&PartitionId::new("DE").unwrap());
        assert_eq!(de.local_path, PathBuf::from("/elsewhere/de.db"));
    }

    #[test]
    fn parses_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            local_root = "/var/app/data"
            lease_wait_secs = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.local_root, PathBuf::from("/var/app/data"));
        assert_eq!(config.lease_wait_secs, 10);
        // Everything else keeps its default.
        assert_eq!(config.lease_duration_secs, 180);
    }
}
