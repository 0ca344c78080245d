//! Foundation types for parsync.
//!
//! This crate provides the value, identity, and bookkeeping types used
//! throughout the parsync replication engine. Every other parsync crate
//! depends on `parsync-types`.
//!
//! # Key Types
//!
//! - [`PartitionId`] — Validated identifier of one replication unit
//! - [`TableValue`] — Tagged value union for dynamically-typed columns
//! - [`Record`] — One relational row flowing by value between components
//! - [`ChangeLogEntry`] — One logged local mutation awaiting propagation
//! - [`Lease`] — Time-bounded mutual-exclusion token in the shared store
//! - [`SyncState`] — Ephemeral per-partition synchronization status

pub mod changelog;
pub mod error;
pub mod fingerprint;
pub mod lease;
pub mod partition;
pub mod state;
pub mod value;

pub use changelog::{ChangeLogEntry, Operation};
pub use error::TypeError;
pub use fingerprint::{fingerprint, is_fingerprint_input, FINGERPRINT_COLUMN};
pub use lease::{Lease, LeaseStatus};
pub use partition::PartitionId;
pub use state::{SyncState, SyncStateKind};
pub use value::{
    ColumnInfo, Record, TableSchema, TableValue, SOFT_DELETE_AT_COLUMN, SOFT_DELETE_COLUMN,
};
