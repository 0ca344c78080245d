//! Change tracking for parsync.
//!
//! Every local mutation is shadowed by a [`parsync_types::ChangeLogEntry`]
//! written in the *same* store transaction as the mutation itself: a crash
//! before commit loses both together, never just one. The log is the exact,
//! gap-free record of what still has to be pushed to the shared store.

pub mod error;
pub mod session;
pub mod tracker;

pub use error::{ChangeLogError, ChangeLogResult};
pub use session::ChangeSession;
pub use tracker::ChangeTracker;
