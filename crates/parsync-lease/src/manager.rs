use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parsync_store::TableDriver;
use parsync_types::{Lease, PartitionId};

use crate::error::{LeaseError, LeaseResult};
use crate::liveness::{local_host, process_alive};

/// Default lease duration when the caller does not configure one.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(180);

/// Base delay between acquisition attempts while waiting out a holder.
const RETRY_DELAY: Duration = Duration::from_millis(250);
/// Upper bound of the random jitter added to each retry delay.
const RETRY_JITTER_MS: u64 = 250;

/// Heartbeat period for a lease of the given duration:
/// `max(15s, min(120s, D/2))`. Renewing at half the duration keeps one
/// missed beat survivable; the floor and ceiling bound the renewal traffic
/// on the shared volume.
pub fn heartbeat_interval(duration: Duration) -> Duration {
    (duration / 2).clamp(Duration::from_secs(15), Duration::from_secs(120))
}

/// Lease configuration.
#[derive(Clone, Debug)]
pub struct LeaseOptions {
    /// How long an acquired lease lives without renewal.
    pub duration: Duration,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            duration: DEFAULT_LEASE_DURATION,
        }
    }
}

/// Acquires, renews, and releases the single global lease of one
/// partition's shared store.
pub struct LeaseManager {
    driver: Arc<dyn TableDriver>,
    partition: PartitionId,
    options: LeaseOptions,
    owner_host: String,
    owner_pid: u32,
}

impl LeaseManager {
    /// Attach to a shared store. Creating the lease table is the one
    /// non-negotiable step: if it fails, the partition cannot be
    /// coordinated at all and the error is fatal to the caller.
    pub fn new(
        driver: Arc<dyn TableDriver>,
        partition: PartitionId,
        options: LeaseOptions,
    ) -> LeaseResult<Self> {
        driver.ensure_lease_table()?;
        Ok(Self {
            driver,
            partition,
            options,
            owner_host: local_host(),
            owner_pid: std::process::id(),
        })
    }

    /// The unexpired lease currently recorded, if any.
    pub fn current(&self) -> LeaseResult<Option<Lease>> {
        Ok(self.driver.active_lease(Utc::now())?)
    }

    /// Acquire the partition lease, waiting up to `wait` for a competing
    /// holder to finish. A zero budget means a single attempt.
    ///
    /// Every attempt first clears reclaimable rows: leases whose expiry
    /// has passed, and leases recorded by this host for a process that is
    /// no longer alive (self-healing after a crash).
    pub async fn acquire(&self, reason: &str, wait: Duration) -> LeaseResult<LeaseGuard> {
        let deadline = Instant::now() + wait;
        loop {
            let driver = self.driver.clone();
            let host = self.owner_host.clone();
            let pid = self.owner_pid;
            let reason_owned = reason.to_string();
            let duration = self.options.duration;

            let acquired = tokio::task::spawn_blocking(move || {
                attempt_acquire(&driver, &host, pid, &reason_owned, duration)
            })
            .await
            .map_err(|e| LeaseError::Task(e.to_string()))??;

            if let Some(lease) = acquired {
                info!(
                    partition = %self.partition,
                    lease = %lease.lease_id,
                    reason,
                    "lease acquired"
                );
                return Ok(LeaseGuard::start(
                    self.driver.clone(),
                    lease,
                    self.options.duration,
                ));
            }

            if Instant::now() >= deadline {
                debug!(partition = %self.partition, ?wait, "lease wait budget exhausted");
                return Err(LeaseError::Timeout {
                    partition: self.partition.clone(),
                    waited: wait,
                });
            }

            let jitter = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
            tokio::time::sleep(RETRY_DELAY + Duration::from_millis(jitter)).await;
        }
    }
}

/// One acquisition attempt. Blocking; runs on the blocking pool.
fn attempt_acquire(
    driver: &Arc<dyn TableDriver>,
    owner_host: &str,
    owner_pid: u32,
    reason: &str,
    duration: Duration,
) -> LeaseResult<Option<Lease>> {
    let now = Utc::now();
    let expired = driver.delete_expired_leases(now)?;
    if expired > 0 {
        debug!(expired, "cleared expired lease rows");
    }

    for lease in driver.all_leases()? {
        if lease.owner_host == owner_host
            && lease.owner_pid != owner_pid
            && !process_alive(lease.owner_pid)
        {
            if driver.delete_lease(lease.lease_id)? {
                warn!(
                    lease = %lease.lease_id,
                    pid = lease.owner_pid,
                    "reclaimed lease from dead process"
                );
            }
        }
    }

    let lease = Lease::issue(reason, owner_host, owner_pid, duration);
    if driver.try_insert_lease(&lease)? {
        Ok(Some(lease))
    } else {
        Ok(None)
    }
}

/// Renew a held lease once. Failures are swallowed by design: a missed
/// beat only risks expiry and reclamation, which the holder survives by
/// losing the lease rather than by deadlocking the partition.
///
/// Returns `true` only when a renewal was actually written. The released
/// flag is checked immediately before the write so a guard that has been
/// released can never renew.
pub(crate) async fn renew_once(
    driver: &Arc<dyn TableDriver>,
    lease_id: Uuid,
    duration: Duration,
    released: &AtomicBool,
) -> bool {
    if released.load(Ordering::SeqCst) {
        return false;
    }
    let driver = driver.clone();
    let expires_at = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
    match tokio::task::spawn_blocking(move || driver.renew_lease(lease_id, expires_at)).await {
        Ok(Ok(true)) => {
            debug!(lease = %lease_id, "lease renewed");
            true
        }
        Ok(Ok(false)) => {
            warn!(lease = %lease_id, "lease row vanished during renewal");
            false
        }
        Ok(Err(e)) => {
            warn!(lease = %lease_id, error = %e, "lease heartbeat failed");
            false
        }
        Err(e) => {
            warn!(lease = %lease_id, error = %e, "lease heartbeat task failed");
            false
        }
    }
}

async fn heartbeat_loop(
    driver: Arc<dyn TableDriver>,
    lease_id: Uuid,
    duration: Duration,
    released: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(heartbeat_interval(duration));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // The first tick completes immediately.
    loop {
        ticker.tick().await;
        if released.load(Ordering::SeqCst) {
            return;
        }
        renew_once(&driver, lease_id, duration, &released).await;
    }
}

/// A held lease. Renewed by a background heartbeat until released or
/// dropped; the row is deleted on release and, best-effort, on drop.
pub struct LeaseGuard {
    lease: Lease,
    driver: Arc<dyn TableDriver>,
    released: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
    row_deleted: bool,
}

impl LeaseGuard {
    fn start(driver: Arc<dyn TableDriver>, lease: Lease, duration: Duration) -> Self {
        let released = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat_loop(
            driver.clone(),
            lease.lease_id,
            duration,
            released.clone(),
        ));
        Self {
            lease,
            driver,
            released,
            heartbeat,
            row_deleted: false,
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    fn defuse(&mut self) {
        self.released.store(true, Ordering::SeqCst);
        self.heartbeat.abort();
    }

    /// Release the lease: stop the heartbeat, then delete the row.
    ///
    /// A failed delete is logged and swallowed; the row self-expires,
    /// which bounds how long a stuck holder can block the partition.
    pub async fn release(mut self) -> LeaseResult<()> {
        self.defuse();
        self.row_deleted = true;
        let driver = self.driver.clone();
        let lease_id = self.lease.lease_id;
        match tokio::task::spawn_blocking(move || driver.delete_lease(lease_id)).await {
            Ok(Ok(_)) => {
                debug!(lease = %lease_id, "lease released");
            }
            Ok(Err(e)) => {
                warn!(lease = %lease_id, error = %e, "lease release failed; row will expire");
            }
            Err(e) => {
                warn!(lease = %lease_id, error = %e, "lease release task failed");
            }
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.defuse();
        if self.row_deleted {
            return;
        }
        let driver = self.driver.clone();
        let lease_id = self.lease.lease_id;
        // Best effort only: without an async context the row is simply
        // left to expire.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(move || {
                if let Err(e) = driver.delete_lease(lease_id) {
                    warn!(lease = %lease_id, error = %e, "lease cleanup on drop failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parsync_store::SqliteDriver;
    use tempfile::TempDir;

    fn shared_store(dir: &TempDir) -> Arc<dyn TableDriver> {
        Arc::new(SqliteDriver::create(dir.path().join("shared.db")).unwrap())
    }

    fn manager(driver: Arc<dyn TableDriver>, duration: Duration) -> LeaseManager {
        LeaseManager::new(
            driver,
            PartitionId::new("ES").unwrap(),
            LeaseOptions { duration },
        )
        .unwrap()
    }

    #[test]
    fn heartbeat_interval_is_clamped() {
        assert_eq!(
            heartbeat_interval(Duration::from_secs(180)),
            Duration::from_secs(90)
        );
        assert_eq!(
            heartbeat_interval(Duration::from_secs(10)),
            Duration::from_secs(15)
        );
        assert_eq!(
            heartbeat_interval(Duration::from_secs(600)),
            Duration::from_secs(120)
        );
    }

    #[tokio::test]
    async fn racing_acquirers_get_exactly_one_lease() {
        let dir = TempDir::new().unwrap();
        let a = manager(shared_store(&dir), Duration::from_secs(60));
        let b = manager(shared_store(&dir), Duration::from_secs(60));

        let budget = Duration::from_secs(1);
        let (ra, rb) = tokio::join!(a.acquire("push", budget), b.acquire("push", budget));

        let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "exactly one acquirer may win");
        let loser = if ra.is_ok() { rb } else { ra };
        assert!(loser.err().unwrap().is_timeout());
    }

    #[tokio::test]
    async fn release_frees_the_partition() {
        let dir = TempDir::new().unwrap();
        let driver = shared_store(&dir);
        let mgr = manager(driver.clone(), Duration::from_secs(60));

        let guard = mgr.acquire("push", Duration::ZERO).await.unwrap();
        assert!(mgr.current().unwrap().is_some());
        guard.release().await.unwrap();
        assert!(mgr.current().unwrap().is_none());

        // And it can be taken again immediately.
        let again = mgr.acquire("push", Duration::ZERO).await.unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_on_acquire() {
        let dir = TempDir::new().unwrap();
        let driver = shared_store(&dir);
        driver.ensure_lease_table().unwrap();

        let mut stale = Lease::issue("push", "other-host", 1, Duration::from_secs(60));
        stale.created_at = Utc::now() - chrono::Duration::minutes(10);
        stale.expires_at = Utc::now() - chrono::Duration::minutes(7);
        assert!(driver.try_insert_lease(&stale).unwrap());

        let mgr = manager(driver.clone(), Duration::from_secs(60));
        let guard = mgr.acquire("push", Duration::ZERO).await.unwrap();
        assert_ne!(guard.lease().lease_id, stale.lease_id);
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn dead_owner_on_this_host_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let driver = shared_store(&dir);
        driver.ensure_lease_table().unwrap();

        // Unexpired, but owned by a pid that cannot be alive here.
        let zombie = Lease::issue("push", local_host(), u32::MAX - 1, Duration::from_secs(600));
        assert!(driver.try_insert_lease(&zombie).unwrap());

        let mgr = manager(driver.clone(), Duration::from_secs(60));
        let guard = mgr.acquire("push", Duration::ZERO).await.unwrap();
        assert_ne!(guard.lease().lease_id, zombie.lease_id);
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn live_holder_blocks_zero_budget_acquirer() {
        let dir = TempDir::new().unwrap();
        let driver = shared_store(&dir);
        let mgr = manager(driver.clone(), Duration::from_secs(60));

        let guard = mgr.acquire("push", Duration::ZERO).await.unwrap();
        let rival = manager(shared_store(&dir), Duration::from_secs(60));
        let denied = rival.acquire("push", Duration::ZERO).await;
        assert!(denied.err().unwrap().is_timeout());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn released_guard_never_renews() {
        let dir = TempDir::new().unwrap();
        let driver = shared_store(&dir);
        driver.ensure_lease_table().unwrap();

        let lease = Lease::issue("push", local_host(), std::process::id(), Duration::from_secs(60));
        assert!(driver.try_insert_lease(&lease).unwrap());
        let expiry_before = driver.active_lease(Utc::now()).unwrap().unwrap().expires_at;

        let released = AtomicBool::new(true);
        let renewed = renew_once(&driver, lease.lease_id, Duration::from_secs(60), &released).await;
        assert!(!renewed);
        let expiry_after = driver.active_lease(Utc::now()).unwrap().unwrap().expires_at;
        assert_eq!(expiry_before, expiry_after);
    }
}
