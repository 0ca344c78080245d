//! The parsync engine.
//!
//! Orchestrates everything the leaf crates provide: drains the change log
//! into the shared store under the partition lease
//! ([`push::PushSynchronizer`]), owns the per-partition state machine and
//! observer notifications ([`coordinator::SyncCoordinator`]), and
//! serializes fire-and-forget maintenance work
//! ([`queue::BackgroundQueue`]).
//!
//! Within one process, sync is single-flight per partition; partitions are
//! fully independent. Store I/O runs on the blocking pool so one
//! partition's slow network volume never stalls another's.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod opener;
pub mod push;
pub mod queue;

pub use config::{EngineConfig, PartitionLocations};
pub use coordinator::SyncCoordinator;
pub use error::{EngineError, EngineResult};
pub use events::{EventFilter, EventStream, StatePublisher, SyncEvent};
pub use opener::{SqliteOpener, StaticOpener, StoreOpener};
pub use push::{PushOutcome, PushSynchronizer};
pub use queue::BackgroundQueue;
