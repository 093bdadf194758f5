//! Best-effort persistence side channel.
//!
//! Cache writes to the durable store must never block the hot path, but
//! their failures should still be observable. Writes are queued on a bounded
//! channel and applied by a background task; outcomes are counted.

use crate::kv::KeyValueStore;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

enum PersistOp {
    Set { key: String, value: String },
    Delete { key: String },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of queue outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PersistStats {
    pub applied: u64,
    pub failed: u64,
    /// Writes discarded because the queue was full or closed.
    pub dropped: u64,
}

pub struct PersistQueue {
    tx: mpsc::Sender<PersistOp>,
    counters: Arc<Counters>,
}

impl PersistQueue {
    /// Start the background writer. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<PersistOp>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker_counters = counters.clone();

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let (key, outcome) = match op {
                    PersistOp::Set { key, value } => {
                        let outcome = store.set_raw(&key, value).await;
                        (key, outcome)
                    }
                    PersistOp::Delete { key } => {
                        let outcome = store.delete(&key).await;
                        (key, outcome)
                    }
                    PersistOp::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                match outcome {
                    Ok(()) => {
                        worker_counters.applied.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!("best-effort persist of `{}` failed: {}", key, err);
                    }
                }
            }
            debug!("persist queue closed");
        });

        Self { tx, counters }
    }

    fn enqueue(&self, op: PersistOp) {
        if let Err(err) = self.tx.try_send(op) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("persist queue rejected write: {}", err);
        }
    }

    pub fn enqueue_set(&self, key: impl Into<String>, value: String) {
        self.enqueue(PersistOp::Set {
            key: key.into(),
            value,
        });
    }

    pub fn enqueue_delete(&self, key: impl Into<String>) {
        self.enqueue(PersistOp::Delete { key: key.into() });
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PersistOp::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn stats(&self) -> PersistStats {
        PersistStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[tokio::test]
    async fn applies_writes_in_order() {
        let store = Arc::new(MemoryKvStore::new());
        let queue = PersistQueue::spawn(store.clone(), 8);
        queue.enqueue_set("a", "1".into());
        queue.enqueue_set("a", "2".into());
        queue.enqueue_delete("b");
        queue.flush().await;

        assert_eq!(store.get_raw("a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(queue.stats().applied, 3);
    }

    #[tokio::test]
    async fn failures_are_counted_not_raised() {
        let store = Arc::new(MemoryKvStore::new());
        store.set_failing(true);
        let queue = PersistQueue::spawn(store.clone(), 8);
        queue.enqueue_set("a", "1".into());
        queue.flush().await;

        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.applied, 0);
    }
}
