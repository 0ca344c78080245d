//! Per-partition sync orchestration.
//!
//! The coordinator is what the rest of the application talks to: it
//! debounces and coalesces sync requests onto the background queue, owns
//! the per-partition state machine (`UpToDate → SyncInProgress →
//! UpToDate|Error`, with `OfflinePending` whenever the shared store or
//! lease is out of reach), and hands out event subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use parsync_types::{PartitionId, SyncState};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::events::{EventFilter, EventStream, StatePublisher};
use crate::opener::StoreOpener;
use crate::push::{PushOutcome, PushSynchronizer};
use crate::queue::BackgroundQueue;

/// Default capacity of subscriber channels.
const SUBSCRIBER_CAPACITY: usize = 64;

/// Orchestrates push scheduling and state publication for all partitions.
pub struct SyncCoordinator {
    opener: Arc<dyn StoreOpener>,
    publisher: Arc<StatePublisher>,
    push: Arc<PushSynchronizer>,
    queue: BackgroundQueue,
    last_scheduled: Mutex<HashMap<PartitionId, Instant>>,
}

impl SyncCoordinator {
    pub fn new(opener: Arc<dyn StoreOpener>, config: EngineConfig) -> Self {
        let publisher = Arc::new(StatePublisher::new());
        let push = Arc::new(PushSynchronizer::new(
            opener.clone(),
            publisher.clone(),
            config,
        ));
        Self {
            opener,
            publisher,
            push,
            queue: BackgroundQueue::new(),
            last_scheduled: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to state-change events.
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        self.publisher.subscribe(filter, SUBSCRIBER_CAPACITY)
    }

    /// The last published state of a partition.
    pub fn status(&self, partition: &PartitionId) -> SyncState {
        self.publisher.status(partition)
    }

    /// Run a push right now, on the caller's task.
    pub async fn sync_now(&self, partition: &PartitionId) -> EngineResult<PushOutcome> {
        self.push.push_pending(partition).await
    }

    /// Queue a push unless one was scheduled within `min_interval`, or
    /// (when `only_if_pending` is set) the partition has nothing to push.
    ///
    /// Returns `true` if a push was actually enqueued.
    pub async fn schedule_if_needed(
        &self,
        partition: &PartitionId,
        min_interval: Duration,
        only_if_pending: bool,
    ) -> EngineResult<bool> {
        {
            let last = self.last_scheduled.lock().expect("lock poisoned");
            if let Some(previous) = last.get(partition) {
                if previous.elapsed() < min_interval {
                    debug!(partition = %partition, "sync debounced");
                    return Ok(false);
                }
            }
        }

        if only_if_pending {
            let local = self.opener.open_local(partition)?;
            let pending = tokio::task::spawn_blocking(move || {
                let tracker = parsync_changelog::ChangeTracker::new(local)?;
                tracker.pending_count()
            })
            .await
            .map_err(|e| crate::error::EngineError::Task(e.to_string()))??;
            if pending == 0 {
                debug!(partition = %partition, "nothing pending, sync not scheduled");
                return Ok(false);
            }
        }

        self.last_scheduled
            .lock()
            .expect("lock poisoned")
            .insert(partition.clone(), Instant::now());

        let push = self.push.clone();
        let partition = partition.clone();
        let enqueued = self.queue.enqueue(async move {
            // Outcome and errors are published as state; nothing to
            // return from a fire-and-forget item.
            let _ = push.push_pending(&partition).await;
        });
        Ok(enqueued)
    }

    /// Stop the background worker, waiting briefly for in-flight work.
    pub async fn shutdown(&self, grace: Duration) {
        self.queue.shutdown(grace).await;
    }
}
