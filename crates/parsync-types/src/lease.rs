//! Lease rows: time-bounded mutual exclusion recorded in the shared store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Observer-facing lease lifecycle.
///
/// Only `Active` is ever persisted; the remaining states describe how a
/// lease left the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseStatus {
    Active,
    Released,
    Expired,
    /// Reclaimed by another process after expiry or owner death.
    Stolen,
}

/// A time-bounded mutual-exclusion token for one partition.
///
/// Invariant: at most one unexpired lease row exists per partition at any
/// instant. Anyone may delete a row once it has expired or its owning
/// process is no longer alive on its host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Uuid,
    /// Human-readable purpose, e.g. `"push"` or `"publish"`.
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub owner_host: String,
    pub owner_pid: u32,
    pub status: LeaseStatus,
}

impl Lease {
    /// Build a fresh active lease owned by the given host/process.
    pub fn issue(
        reason: impl Into<String>,
        owner_host: impl Into<String>,
        owner_pid: u32,
        duration: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        let ttl = Duration::from_std(duration).unwrap_or_else(|_| Duration::seconds(180));
        Self {
            lease_id: Uuid::now_v7(),
            reason: reason.into(),
            created_at: now,
            expires_at: now + ttl,
            owner_host: owner_host.into(),
            owner_pid,
            status: LeaseStatus::Active,
        }
    }

    /// Returns `true` if the lease has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
