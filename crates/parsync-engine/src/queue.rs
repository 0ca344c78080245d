//! Single-worker background queue for fire-and-forget maintenance work.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One dedicated worker draining a FIFO of zero-argument work items.
///
/// Enqueuing never blocks. Each item runs in its own task so a panic is
/// contained and logged without stopping the worker. Items run strictly
/// one at a time, in submission order.
pub struct BackgroundQueue {
    tx: mpsc::UnboundedSender<Task>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(worker_loop(rx, shutdown_rx));
        Self {
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a work item. Returns `false` after shutdown.
    pub fn enqueue(&self, task: impl Future<Output = ()> + Send + 'static) -> bool {
        self.tx.send(Box::pin(task)).is_ok()
    }

    /// Signal cancellation, wait up to `grace` for the in-flight item,
    /// then release the worker. Items still queued are dropped; an item
    /// still running after the grace period keeps running detached but
    /// nothing new starts.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let handle = self.worker.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("background queue did not stop within grace period");
            }
        }
    }
}

impl Default for BackgroundQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(mut rx: mpsc::UnboundedReceiver<Task>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let task = tokio::select! {
            _ = shutdown.changed() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        // Spawned so a panic lands in the JoinError instead of killing
        // the worker.
        let handle = tokio::spawn(task);
        tokio::select! {
            result = handle => {
                if let Err(e) = result {
                    if e.is_panic() {
                        warn!("background task panicked");
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!("shutdown during in-flight background task");
                break;
            }
        }
    }
}
