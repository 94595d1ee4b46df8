//! Reconciliation queue for vector-index writes that failed after a store
//! write succeeded.
//!
//! The store and the vector index are not joined in a distributed
//! transaction. When the index upsert of ingest step 3 fails, the receipt
//! identifier lands here and a process-wide task retries it with bounded
//! exponential backoff (ceiling five minutes). After eight failures the
//! entry is dropped with a structured warning — at that point the receipt
//! stays queryable by identifier but not by semantic search until the next
//! startup sweep.
//!
//! On process restart the queue is empty; [`reindex_sweep`] runs once at
//! server startup and reconciles the index against the store wholesale.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::embedding::Embedder;
use crate::ingest::sync_vector;
use crate::store::ReceiptStore;
use crate::vector::VectorIndex;

const TICK: Duration = Duration::from_secs(5);
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CEILING: Duration = Duration::from_secs(300);
const MAX_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone, Copy)]
struct Pending {
    id: i64,
    attempts: u32,
    next_due: Instant,
}

/// Process-wide, in-memory, best-effort. Entries survive neither restarts
/// nor panics; the startup sweep covers those cases.
#[derive(Clone, Default)]
pub struct ReconcileQueue {
    inner: Arc<Mutex<Vec<Pending>>>,
}

impl ReconcileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an identifier for retry. Already-queued ids are not
    /// duplicated.
    pub fn push(&self, id: i64) {
        let mut entries = self.inner.lock().unwrap();
        if entries.iter().any(|p| p.id == id) {
            return;
        }
        entries.push(Pending {
            id,
            attempts: 0,
            next_due: Instant::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_due(&self) -> Vec<Pending> {
        let now = Instant::now();
        let mut entries = self.inner.lock().unwrap();
        let (due, waiting): (Vec<Pending>, Vec<Pending>) =
            entries.drain(..).partition(|p| p.next_due <= now);
        *entries = waiting;
        due
    }

    fn requeue(&self, pending: Pending) {
        self.inner.lock().unwrap().push(pending);
    }
}

fn backoff(attempts: u32) -> Duration {
    let exp = BACKOFF_BASE * 2u32.saturating_pow(attempts.min(16));
    exp.min(BACKOFF_CEILING)
}

/// Spawn the periodic retry task. Runs for the lifetime of the process.
pub fn spawn_reconciler(
    queue: ReconcileQueue,
    store: ReceiptStore,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(TICK).await;
            run_once(&queue, &store, index.as_ref(), embedder.as_ref()).await;
        }
    })
}

/// One queue pass: retry everything due, requeue failures with backoff,
/// drop entries that exhausted their attempts.
pub async fn run_once(
    queue: &ReconcileQueue,
    store: &ReceiptStore,
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
) {
    for mut pending in queue.take_due() {
        match sync_vector(store, index, embedder, pending.id).await {
            Ok(()) => {
                debug!(receipt_id = pending.id, "vector index reconciled");
            }
            Err(e) => {
                pending.attempts += 1;
                if pending.attempts >= MAX_ATTEMPTS {
                    warn!(
                        receipt_id = pending.id,
                        attempts = pending.attempts,
                        error = %e,
                        "dropping receipt from reconciliation queue"
                    );
                } else {
                    pending.next_due = Instant::now() + backoff(pending.attempts);
                    queue.requeue(pending);
                }
            }
        }
    }
}

/// Full re-index sweep, run once at server startup: every store receipt
/// missing from the index is added, every index entry without a store row
/// is evicted. Returns `(added, removed)`.
pub async fn reindex_sweep(
    store: &ReceiptStore,
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
) -> anyhow::Result<(u64, u64)> {
    let store_ids = store.all_ids().await?;
    let index_ids = index.ids().await?;

    let mut added = 0u64;
    for id in &store_ids {
        if !index_ids.contains(id) {
            sync_vector(store, index, embedder, *id).await?;
            added += 1;
        }
    }

    let mut removed = 0u64;
    for id in &index_ids {
        if !store_ids.contains(id) {
            index.remove(*id).await?;
            removed += 1;
        }
    }

    if added > 0 || removed > 0 {
        info!(added, removed, "re-index sweep reconciled vector index");
    }
    Ok((added, removed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_deduplicates() {
        let queue = ReconcileQueue::new();
        queue.push(1);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(0), Duration::from_secs(2));
        assert_eq!(backoff(1), Duration::from_secs(4));
        assert_eq!(backoff(5), Duration::from_secs(64));
        assert_eq!(backoff(8), Duration::from_secs(300));
        assert_eq!(backoff(30), Duration::from_secs(300));
    }

    #[test]
    fn take_due_leaves_future_entries() {
        let queue = ReconcileQueue::new();
        queue.push(1);
        queue.requeue(Pending {
            id: 2,
            attempts: 1,
            next_due: Instant::now() + Duration::from_secs(60),
        });

        let due = queue.take_due();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, 1);
        assert_eq!(queue.len(), 1);
    }
}
