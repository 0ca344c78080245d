//! Snapshot replication for parsync.
//!
//! Whole-store replication for provisioning and full resync: the local
//! copy of a partition is refreshed from the shared volume (or published
//! back to it) by copying the store file to a temporary path on the
//! destination volume and atomically swapping it into place. A reader
//! concurrent with the swap sees either the old file or the new one,
//! never a half-written mixture.
//!
//! Stores also travel as zstd-compressed snapshots with a checksummed
//! sidecar manifest; an unchanged snapshot (same source size and mtime)
//! skips the copy over the network entirely.

pub mod archive;
pub mod compact;
pub mod error;
pub mod replicator;
pub mod swap;

pub use archive::{SnapshotManifest, source_stamp, write_snapshot};
pub use compact::Compactor;
pub use error::{SnapshotError, SnapshotResult};
pub use replicator::{SnapshotOutcome, SnapshotPaths, SnapshotReplicator};
pub use swap::atomic_swap;
