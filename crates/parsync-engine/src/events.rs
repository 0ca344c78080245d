//! Sync-state notifications.
//!
//! State changes are fanned out to subscribers through per-subscriber
//! broadcast channels. Publishing never blocks and never fails the
//! publisher: a slow observer loses old events from its own channel, a
//! closed one is pruned on the next publish.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use tokio::sync::broadcast;
use tracing::debug;

use parsync_types::{PartitionId, SyncState, SyncStateKind};

/// One published state change.
#[derive(Clone, Debug)]
pub struct SyncEvent {
    pub partition: PartitionId,
    pub state: SyncState,
}

/// Filter for subscribing to a subset of sync events.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// If set, only events for these partitions are delivered.
    pub partitions: Option<Vec<PartitionId>>,
    /// If set, only events of these kinds are delivered.
    pub kinds: Option<Vec<SyncStateKind>>,
}

impl EventFilter {
    /// Returns `true` if the given event matches this filter.
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref partitions) = self.partitions {
            if !partitions.contains(&event.partition) {
                return false;
            }
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.state.kind) {
                return false;
            }
        }
        true
    }
}

/// A broadcast channel receiver for sync events.
pub type EventStream = broadcast::Receiver<SyncEvent>;

/// Internal subscriber: a filter paired with a broadcast sender.
struct Subscriber {
    filter: EventFilter,
    sender: broadcast::Sender<SyncEvent>,
}

/// Tracks per-partition state and fans changes out to observers.
pub struct StatePublisher {
    states: Mutex<HashMap<PartitionId, SyncState>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl StatePublisher {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a new subscriber with the given filter.
    pub fn subscribe(&self, filter: EventFilter, capacity: usize) -> EventStream {
        let (tx, rx) = broadcast::channel(capacity);
        self.subscribers
            .write()
            .expect("lock poisoned")
            .push(Subscriber { filter, sender: tx });
        rx
    }

    /// The last published state of a partition.
    pub fn status(&self, partition: &PartitionId) -> SyncState {
        self.states
            .lock()
            .expect("lock poisoned")
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    /// Record and fan out a state change. Fire-and-forget: send failures
    /// only mean a subscriber is gone, and those are pruned.
    pub fn publish(&self, partition: &PartitionId, state: SyncState) {
        debug!(
            partition = %partition,
            kind = ?state.kind,
            pending = state.pending,
            "sync state changed"
        );
        self.states
            .lock()
            .expect("lock poisoned")
            .insert(partition.clone(), state.clone());

        let event = SyncEvent {
            partition: partition.clone(),
            state,
        };
        let mut subs = self.subscribers.write().expect("lock poisoned");
        subs.retain(|sub| {
            if sub.filter.matches(&event) {
                // If send fails (no receivers), the subscriber is stale.
                sub.sender.send(event.clone()).is_ok()
            } else {
                // Keep non-matching subscribers; they may match future
                // events. Only prune if the channel itself is closed.
                sub.sender.receiver_count() > 0
            }
        });
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("lock poisoned").len()
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn es() -> PartitionId {
        PartitionId::new("ES").unwrap()
    }

    #[tokio::test]
    async fn publishes_to_matching_subscribers() {
        let publisher = StatePublisher::new();
        let mut all = publisher.subscribe(EventFilter::default(), 8);
        let mut errors_only = publisher.subscribe(
            EventFilter {
                kinds: Some(vec![SyncStateKind::Error]),
                ..EventFilter::default()
            },
            8,
        );

        publisher.publish(&es(), SyncState::new(SyncStateKind::SyncInProgress, 3));

        let event = all.try_recv().unwrap();
        assert_eq!(event.state.kind, SyncStateKind::SyncInProgress);
        assert_eq!(event.state.pending, 3);
        assert!(errors_only.try_recv().is_err());

        assert_eq!(publisher.status(&es()).kind, SyncStateKind::SyncInProgress);
    }

    #[tokio::test]
    async fn partition_filter_applies() {
        let publisher = StatePublisher::new();
        let de = PartitionId::new("DE").unwrap();
        let mut de_only = publisher.subscribe(
            EventFilter {
                partitions: Some(vec![de.clone()]),
                ..EventFilter::default()
            },
            8,
        );

        publisher.publish(&es(), SyncState::new(SyncStateKind::UpToDate, 0));
        assert!(de_only.try_recv().is_err());
        publisher.publish(&de, SyncState::new(SyncStateKind::UpToDate, 0));
        assert_eq!(de_only.try_recv().unwrap().partition, de);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let publisher = StatePublisher::new();
        let rx = publisher.subscribe(EventFilter::default(), 8);
        assert_eq!(publisher.subscriber_count(), 1);
        drop(rx);
        publisher.publish(&es(), SyncState::new(SyncStateKind::UpToDate, 0));
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
