//! Optimistic push reconciliation.
//!
//! A push drains the partition's unsynchronized change-log entries into
//! the shared store inside one transaction, under the partition lease.
//! Entries carry identity and kind, not payload: the *current* local row
//! is re-read at push time, so a later edit naturally supersedes an
//! earlier logged operation and the two coalesce into a single shared
//! write, yet both entries are marked synchronized afterwards. The
//! fingerprint stored on each shared row turns replays and no-op edits
//! into skips, which is what makes pushing idempotent and at-least-once
//! delivery safe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, warn};

use parsync_changelog::ChangeTracker;
use parsync_lease::{LeaseManager, LeaseOptions};
use parsync_store::{with_retry, DriverTransaction, StoreResult, TableDriver};
use parsync_store::retry::{DEFAULT_ATTEMPTS, DEFAULT_BACKOFF};
use parsync_types::{
    fingerprint, ChangeLogEntry, Operation, PartitionId, Record, SyncState, SyncStateKind,
    TableSchema, TableValue, FINGERPRINT_COLUMN,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::StatePublisher;
use crate::opener::StoreOpener;

/// What one `push_pending` call did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Another push for this partition is already running in this
    /// process; no work was started.
    AlreadyInFlight,
    /// The change log was empty.
    NothingToPush,
    /// The shared store was unreachable or the lease could not be won
    /// within the wait budget. The entries stay pending.
    Offline { pending: u64 },
    /// The batch was committed: `applied` shared writes, `skipped`
    /// entries that needed none (superseded or fingerprint-identical).
    Applied { applied: usize, skipped: usize },
}

/// Result of applying a batch inside the shared-store transaction.
struct ApplyReport {
    /// Ids of every entry the batch dealt with, to be marked
    /// synchronized after commit.
    processed: Vec<i64>,
    applied: usize,
    skipped: usize,
}

/// Drains pending change-log entries into the shared store.
pub struct PushSynchronizer {
    opener: Arc<dyn StoreOpener>,
    publisher: Arc<StatePublisher>,
    config: EngineConfig,
    /// Per-partition single-flight gates.
    inflight: Mutex<HashMap<PartitionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl PushSynchronizer {
    pub fn new(
        opener: Arc<dyn StoreOpener>,
        publisher: Arc<StatePublisher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            opener,
            publisher,
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, partition: &PartitionId) -> Arc<tokio::sync::Mutex<()>> {
        self.inflight
            .lock()
            .expect("lock poisoned")
            .entry(partition.clone())
            .or_default()
            .clone()
    }

    /// Push everything pending for one partition.
    ///
    /// Single-flight per partition: a concurrent second call returns
    /// [`PushOutcome::AlreadyInFlight`] immediately instead of starting a
    /// parallel push.
    pub async fn push_pending(&self, partition: &PartitionId) -> EngineResult<PushOutcome> {
        let gate = self.gate(partition);
        let Ok(_guard) = gate.try_lock() else {
            debug!(partition = %partition, "push already in flight");
            return Ok(PushOutcome::AlreadyInFlight);
        };

        match self.run_push(partition).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let pending = self.publisher.status(partition).pending;
                self.publisher.publish(
                    partition,
                    SyncState::with_error(SyncStateKind::Error, pending, e.to_string()),
                );
                Err(e)
            }
        }
    }

    async fn run_push(&self, partition: &PartitionId) -> EngineResult<PushOutcome> {
        let local = self.opener.open_local(partition)?;
        let tracker = Arc::new(ChangeTracker::new(local.clone())?);

        let entries = {
            let tracker = tracker.clone();
            run_blocking(move || tracker.unsynchronized()).await?
        };
        if entries.is_empty() {
            self.publisher
                .publish(partition, SyncState::new(SyncStateKind::UpToDate, 0));
            return Ok(PushOutcome::NothingToPush);
        }
        let pending = entries.len() as u64;
        self.publisher.publish(
            partition,
            SyncState::new(SyncStateKind::SyncInProgress, pending),
        );

        let shared = match self.opener.open_shared(partition) {
            Ok(shared) => shared,
            Err(e) => {
                debug!(partition = %partition, error = %e, "shared store unreachable");
                self.publisher.publish(
                    partition,
                    SyncState::with_error(SyncStateKind::OfflinePending, pending, e.to_string()),
                );
                return Ok(PushOutcome::Offline { pending });
            }
        };

        let leases = LeaseManager::new(
            shared.clone(),
            partition.clone(),
            LeaseOptions {
                duration: self.config.lease_duration(),
            },
        )?;
        let lease = match leases.acquire("push", self.config.lease_wait()).await {
            Ok(guard) => guard,
            Err(e) if e.is_timeout() => {
                self.publisher.publish(
                    partition,
                    SyncState::with_error(SyncStateKind::OfflinePending, pending, e.to_string()),
                );
                return Ok(PushOutcome::Offline { pending });
            }
            Err(e) => return Err(e.into()),
        };

        let started = Instant::now();
        let finished = Arc::new(AtomicBool::new(false));
        let watchdog = spawn_watchdog(
            partition.clone(),
            self.config.push_warn_after(),
            finished.clone(),
        );

        let report = {
            let local = local.clone();
            let shared = shared.clone();
            let entries = entries.clone();
            run_blocking(move || apply_batch(&local, &shared, &entries)).await
        };
        finished.store(true, Ordering::SeqCst);
        watchdog.abort();

        let report = match report {
            Ok(report) => report,
            Err(e) => {
                // The transaction already rolled back; nothing was marked,
                // so the next push retries the whole batch.
                lease.release().await?;
                return Err(e);
            }
        };

        {
            let tracker = tracker.clone();
            let ids = report.processed.clone();
            run_blocking(move || tracker.mark_synchronized(&ids)).await?;
        }
        lease.release().await?;

        info!(
            partition = %partition,
            applied = report.applied,
            skipped = report.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "push complete"
        );
        self.publisher
            .publish(partition, SyncState::new(SyncStateKind::UpToDate, 0));
        Ok(PushOutcome::Applied {
            applied: report.applied,
            skipped: report.skipped,
        })
    }
}

async fn run_blocking<T, E, F>(f: F) -> EngineResult<T>
where
    T: Send + 'static,
    E: Into<EngineError> + Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?
        .map_err(Into::into)
}

fn spawn_watchdog(
    partition: PartitionId,
    threshold: std::time::Duration,
    finished: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(threshold).await;
        if !finished.load(Ordering::SeqCst) {
            warn!(
                partition = %partition,
                threshold_secs = threshold.as_secs(),
                "push exceeding duration threshold"
            );
        }
    })
}

/// Apply all entries in ascending-id order inside one shared-store
/// transaction. Any failure rolls the whole batch back (drop = rollback),
/// so entries are never marked synchronized for writes that did not land.
fn apply_batch(
    local: &Arc<dyn TableDriver>,
    shared: &Arc<dyn TableDriver>,
    entries: &[ChangeLogEntry],
) -> StoreResult<ApplyReport> {
    // Introspect every involved table up front: schema lookups must not
    // touch the connection once the transaction holds it, and a table
    // missing on the shared side downgrades its entries to skips instead
    // of failing the batch.
    let mut schemas: HashMap<String, Option<TableSchema>> = HashMap::new();
    for entry in entries {
        if !schemas.contains_key(&entry.table_name) {
            let schema = match shared.table_schema(&entry.table_name) {
                Ok(schema) => Some(schema),
                Err(e) if e.is_integrity() => {
                    warn!(table = %entry.table_name, error = %e, "table not pushable, skipping its entries");
                    None
                }
                Err(e) => return Err(e),
            };
            schemas.insert(entry.table_name.clone(), schema);
        }
    }

    let mut txn = with_retry(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || shared.begin())?;
    let mut report = ApplyReport {
        processed: Vec::with_capacity(entries.len()),
        applied: 0,
        skipped: 0,
    };

    for entry in entries {
        let outcome = match schemas.get(&entry.table_name) {
            Some(Some(schema)) => apply_entry(&mut *txn, local, schema, entry),
            _ => Ok(EntryOutcome::Skipped),
        };
        match outcome {
            Ok(EntryOutcome::Applied) => report.applied += 1,
            Ok(EntryOutcome::Skipped) => report.skipped += 1,
            Err(e) if e.is_integrity() => {
                // Row-level trouble (vanished row, constraint) skips the
                // single entry, never the batch.
                warn!(
                    entry = entry.id,
                    table = %entry.table_name,
                    record = %entry.record_id,
                    error = %e,
                    "skipping unappliable entry"
                );
                report.skipped += 1;
            }
            Err(e) => return Err(e),
        }
        report.processed.push(entry.id);
    }

    txn.commit()?;
    Ok(report)
}

enum EntryOutcome {
    Applied,
    Skipped,
}

fn apply_entry(
    txn: &mut dyn DriverTransaction,
    local: &Arc<dyn TableDriver>,
    schema: &TableSchema,
    entry: &ChangeLogEntry,
) -> StoreResult<EntryOutcome> {
    match &entry.operation {
        Operation::Delete => {
            let existed = if schema.supports_soft_delete() {
                with_retry(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
                    txn.soft_delete(&entry.table_name, &entry.record_id, entry.timestamp_utc)
                })?
            } else {
                with_retry(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
                    txn.hard_delete(&entry.table_name, &entry.record_id)
                })?
            };
            Ok(if existed {
                EntryOutcome::Applied
            } else {
                EntryOutcome::Skipped
            })
        }
        Operation::Insert | Operation::Update(_) => {
            // Re-read the current local row: the entry records identity,
            // not payload, so a later edit supersedes this one.
            let Some(mut current) = local.read_record(&entry.table_name, &entry.record_id)?
            else {
                // Gone locally: a later delete entry will handle it.
                return Ok(EntryOutcome::Skipped);
            };

            let fp = fingerprint(&current);
            if schema.has_column(FINGERPRINT_COLUMN) {
                current
                    .fields
                    .insert(FINGERPRINT_COLUMN.into(), TableValue::Integer(i64::from(fp)));
            }

            match txn.read_record(&entry.table_name, &entry.record_id)? {
                Some(existing) => {
                    if stored_fingerprint(&existing) == Some(fp) {
                        // No business change reached the shared row.
                        return Ok(EntryOutcome::Skipped);
                    }
                    let columns = existing.differing_columns(&current);
                    with_retry(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
                        txn.update_columns(&current, &columns)
                    })?;
                    Ok(EntryOutcome::Applied)
                }
                None => {
                    with_retry(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
                        txn.insert_record(&current)
                    })?;
                    Ok(EntryOutcome::Applied)
                }
            }
        }
    }
}

/// The fingerprint a shared row was last written with, if the column is
/// present and intact.
fn stored_fingerprint(record: &Record) -> Option<u32> {
    match record.fields.get(FINGERPRINT_COLUMN) {
        Some(TableValue::Integer(v)) => u32::try_from(*v).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parsync_store::MemoryDriver;
    use parsync_types::{ColumnInfo, Operation};
    use crate::opener::StaticOpener;

    fn schema(table: &str, columns: &[&str]) -> TableSchema {
        TableSchema {
            table: table.to_string(),
            columns: columns
                .iter()
                .map(|name| ColumnInfo {
                    name: (*name).to_string(),
                    declared_type: String::new(),
                    not_null: false,
                })
                .collect(),
            primary_key: "id".into(),
        }
    }

    fn invoices_schema() -> TableSchema {
        schema(
            "invoices",
            &["id", "amount", "currency", "row_fingerprint", "deleted", "deleted_at"],
        )
    }

    fn invoice(id: i64, amount: i64) -> Record {
        Record::new("invoices", "id")
            .with("id", TableValue::Integer(id))
            .with("amount", TableValue::Integer(amount))
            .with("currency", TableValue::Text("EUR".into()))
    }

    struct Fixture {
        partition: PartitionId,
        local: Arc<MemoryDriver>,
        shared: Arc<MemoryDriver>,
        publisher: Arc<StatePublisher>,
        push: PushSynchronizer,
    }

    fn fixture() -> Fixture {
        let partition = PartitionId::new("ES").unwrap();
        let local = Arc::new(MemoryDriver::new("local"));
        local.create_table(invoices_schema());
        let shared = Arc::new(MemoryDriver::new("shared"));
        shared.create_table(invoices_schema());

        let opener = StaticOpener::new();
        opener.insert(partition.clone(), local.clone(), Some(shared.clone()));

        let publisher = Arc::new(StatePublisher::new());
        let config = EngineConfig {
            lease_wait_secs: 0,
            ..EngineConfig::default()
        };
        let push = PushSynchronizer::new(Arc::new(opener), publisher.clone(), config);
        Fixture {
            partition,
            local,
            shared,
            publisher,
            push,
        }
    }

    fn log_change(driver: &MemoryDriver, record_id: &str, operation: Operation) {
        let mut txn = driver.begin().unwrap();
        txn.append_change("invoices", record_id, &operation, chrono::Utc::now())
            .unwrap();
        txn.commit().unwrap();
    }

    #[tokio::test]
    async fn empty_log_is_up_to_date() {
        let f = fixture();
        let outcome = f.push.push_pending(&f.partition).await.unwrap();
        assert_eq!(outcome, PushOutcome::NothingToPush);
        assert_eq!(f.publisher.status(&f.partition).kind, SyncStateKind::UpToDate);
    }

    #[tokio::test]
    async fn insert_then_update_coalesce_into_one_write() {
        let f = fixture();
        // Insert at 100, then update to 150, before any push.
        f.local.put_record(&invoice(42, 150)).unwrap();
        log_change(&f.local, "42", Operation::Insert);
        log_change(&f.local, "42", Operation::Update(vec!["amount".into()]));

        let outcome = f.push.push_pending(&f.partition).await.unwrap();
        assert_eq!(outcome, PushOutcome::Applied { applied: 1, skipped: 1 });

        // Exactly one shared write, already at the final amount.
        let row = f.shared.read_record("invoices", "42").unwrap().unwrap();
        assert_eq!(row.fields["amount"], TableValue::Integer(150));
        assert!(matches!(
            row.fields.get(FINGERPRINT_COLUMN),
            Some(TableValue::Integer(_))
        ));

        // Both entries are synchronized even though only one write landed.
        assert_eq!(f.local.pending_changes().unwrap(), 0);
        // The lease was released.
        assert!(f.shared.all_leases().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_push_applies_nothing() {
        let f = fixture();
        f.local.put_record(&invoice(42, 100)).unwrap();
        log_change(&f.local, "42", Operation::Insert);

        let first = f.push.push_pending(&f.partition).await.unwrap();
        assert_eq!(first, PushOutcome::Applied { applied: 1, skipped: 0 });

        let second = f.push.push_pending(&f.partition).await.unwrap();
        assert_eq!(second, PushOutcome::NothingToPush);
    }

    #[tokio::test]
    async fn unchanged_row_is_fingerprint_skipped() {
        let f = fixture();
        f.local.put_record(&invoice(42, 100)).unwrap();
        log_change(&f.local, "42", Operation::Insert);
        f.push.push_pending(&f.partition).await.unwrap();

        // A no-op edit gets logged, but the business fields are unchanged.
        log_change(&f.local, "42", Operation::Update(vec!["amount".into()]));
        let outcome = f.push.push_pending(&f.partition).await.unwrap();
        assert_eq!(outcome, PushOutcome::Applied { applied: 0, skipped: 1 });
        assert_eq!(f.local.pending_changes().unwrap(), 0);
    }

    #[tokio::test]
    async fn changed_row_updates_differing_columns() {
        let f = fixture();
        f.local.put_record(&invoice(42, 100)).unwrap();
        log_change(&f.local, "42", Operation::Insert);
        f.push.push_pending(&f.partition).await.unwrap();

        f.local.put_record(&invoice(42, 175)).unwrap();
        log_change(&f.local, "42", Operation::Update(vec!["amount".into()]));
        let outcome = f.push.push_pending(&f.partition).await.unwrap();
        assert_eq!(outcome, PushOutcome::Applied { applied: 1, skipped: 0 });
        let row = f.shared.read_record("invoices", "42").unwrap().unwrap();
        assert_eq!(row.fields["amount"], TableValue::Integer(175));
    }

    #[tokio::test]
    async fn locally_vanished_row_is_superseded() {
        let f = fixture();
        // Logged insert, but the row was deleted locally afterwards; the
        // delete entry follows.
        log_change(&f.local, "42", Operation::Insert);
        log_change(&f.local, "42", Operation::Delete);

        let outcome = f.push.push_pending(&f.partition).await.unwrap();
        // Insert skipped (no local row), delete skipped (nothing shared).
        assert_eq!(outcome, PushOutcome::Applied { applied: 0, skipped: 2 });
        assert_eq!(f.local.pending_changes().unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_soft_deletes_shared_row() {
        let f = fixture();
        f.local.put_record(&invoice(42, 100)).unwrap();
        log_change(&f.local, "42", Operation::Insert);
        f.push.push_pending(&f.partition).await.unwrap();

        {
            let mut txn = f.local.begin().unwrap();
            txn.hard_delete("invoices", "42").unwrap();
            txn.append_change("invoices", "42", &Operation::Delete, chrono::Utc::now())
                .unwrap();
            txn.commit().unwrap();
        }

        let outcome = f.push.push_pending(&f.partition).await.unwrap();
        assert_eq!(outcome, PushOutcome::Applied { applied: 1, skipped: 0 });
        let row = f.shared.read_record("invoices", "42").unwrap().unwrap();
        assert_eq!(row.fields["deleted"], TableValue::Bool(true));
    }

    #[tokio::test]
    async fn unreachable_shared_store_reports_offline() {
        let partition = PartitionId::new("ES").unwrap();
        let local = Arc::new(MemoryDriver::new("local"));
        local.create_table(invoices_schema());
        local.put_record(&invoice(1, 10)).unwrap();
        log_change(&local, "1", Operation::Insert);

        let opener = StaticOpener::new();
        opener.insert(partition.clone(), local.clone(), None);

        let publisher = Arc::new(StatePublisher::new());
        let push =
            PushSynchronizer::new(Arc::new(opener), publisher.clone(), EngineConfig::default());

        let outcome = push.push_pending(&partition).await.unwrap();
        assert_eq!(outcome, PushOutcome::Offline { pending: 1 });
        assert_eq!(
            publisher.status(&partition).kind,
            SyncStateKind::OfflinePending
        );
        // Nothing was marked.
        assert_eq!(local.pending_changes().unwrap(), 1);
    }

    #[tokio::test]
    async fn held_lease_reports_offline_within_budget() {
        let f = fixture();
        f.local.put_record(&invoice(1, 10)).unwrap();
        log_change(&f.local, "1", Operation::Insert);

        // Someone else holds the partition.
        let foreign = parsync_types::Lease::issue(
            "push",
            "other-host",
            12345,
            std::time::Duration::from_secs(600),
        );
        assert!(f.shared.try_insert_lease(&foreign).unwrap());

        let outcome = f.push.push_pending(&f.partition).await.unwrap();
        assert_eq!(outcome, PushOutcome::Offline { pending: 1 });
        assert_eq!(
            f.publisher.status(&f.partition).kind,
            SyncStateKind::OfflinePending
        );
    }

    #[tokio::test]
    async fn concurrent_push_is_single_flight() {
        let f = fixture();
        let gate = f.push.gate(&f.partition);
        let _held = gate.try_lock().unwrap();

        let outcome = f.push.push_pending(&f.partition).await.unwrap();
        assert_eq!(outcome, PushOutcome::AlreadyInFlight);
    }

    #[tokio::test]
    async fn missing_shared_table_skips_its_entries() {
        let f = fixture();
        f.local.create_table(schema("local_only", &["id", "note"]));
        f.local
            .put_record(
                &Record::new("local_only", "id")
                    .with("id", TableValue::Integer(1))
                    .with("note", TableValue::Text("scratch".into())),
            )
            .unwrap();
        {
            let mut txn = f.local.begin().unwrap();
            txn.append_change("local_only", "1", &Operation::Insert, chrono::Utc::now())
                .unwrap();
            txn.commit().unwrap();
        }
        f.local.put_record(&invoice(42, 100)).unwrap();
        log_change(&f.local, "42", Operation::Insert);

        let outcome = f.push.push_pending(&f.partition).await.unwrap();
        assert_eq!(outcome, PushOutcome::Applied { applied: 1, skipped: 1 });
        assert_eq!(f.local.pending_changes().unwrap(), 0);
    }
}
