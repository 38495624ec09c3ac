//! Write-behind queue for published items.
//!
//! Publishing and retracting never wait on storage. Item writes collect here
//! and a background task hands them to the persistence port in one batch,
//! periodically or as soon as the queue grows past its threshold.
//!
//! Pending writes are deduplicated by [`ItemKey`] as they are queued:
//! - a newer add replaces an older pending add for the same key;
//! - a delete drops any pending add for the key and records the delete;
//! - a flush applies deletes before adds, so delete-then-republish keeps the
//!   new version.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PersistenceError;
use crate::item::{ItemKey, PublishedItem, StoredItem};
use crate::metrics;
use crate::ports::PersistencePort;

#[derive(Debug, Default)]
struct PendingWrites {
    next_seq: u64,
    /// Pending adds with their queue order.
    adds: HashMap<ItemKey, (u64, Arc<PublishedItem>)>,
    deletes: HashSet<ItemKey>,
}

impl PendingWrites {
    fn len(&self) -> usize {
        self.adds.len() + self.deletes.len()
    }

    fn record_depth(&self) {
        metrics::record_queue_depth(self.adds.len(), self.deletes.len());
    }
}

/// Pending item writes of one service.
#[derive(Debug)]
pub struct ItemQueue {
    pending: Mutex<PendingWrites>,
    max_items_flush: usize,
    flush_needed: Notify,
}

impl ItemQueue {
    /// Create a queue that asks for an early flush at `max_items_flush`
    /// pending writes.
    pub fn new(max_items_flush: usize) -> Self {
        Self {
            pending: Mutex::new(PendingWrites::default()),
            max_items_flush: max_items_flush.max(1),
            flush_needed: Notify::new(),
        }
    }

    /// Queue an item for saving.
    pub async fn add(&self, item: Arc<PublishedItem>) {
        let mut pending = self.pending.lock().await;
        let seq = pending.next_seq;
        pending.next_seq += 1;
        pending.adds.insert(item.key(), (seq, item));
        self.after_enqueue(&pending);
    }

    /// Queue an item for removal.
    pub async fn delete(&self, key: ItemKey) {
        let mut pending = self.pending.lock().await;
        pending.adds.remove(&key);
        pending.deletes.insert(key);
        self.after_enqueue(&pending);
    }

    /// Forget pending writes of a deleted node.
    pub async fn discard_node(&self, node_id: &str) {
        let mut pending = self.pending.lock().await;
        pending.adds.retain(|key, _| key.node_id != node_id);
        pending.deletes.retain(|key| key.node_id != node_id);
        pending.record_depth();
    }

    fn after_enqueue(&self, pending: &PendingWrites) {
        pending.record_depth();
        if pending.len() >= self.max_items_flush {
            self.flush_needed.notify_one();
        }
    }

    /// Number of pending writes.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether an add is pending for `key`.
    pub async fn is_add_pending(&self, key: &ItemKey) -> bool {
        self.pending.lock().await.adds.contains_key(key)
    }

    /// Whether a delete is pending for `key`.
    pub async fn is_delete_pending(&self, key: &ItemKey) -> bool {
        self.pending.lock().await.deletes.contains(key)
    }

    /// A pending add for `key`, if any. Lets readers see items that were not
    /// flushed yet.
    pub async fn pending_item(&self, key: &ItemKey) -> Option<Arc<PublishedItem>> {
        self.pending
            .lock()
            .await
            .adds
            .get(key)
            .map(|(_, item)| item.clone())
    }

    /// Hand every pending write to the store in one batch.
    ///
    /// On failure the batch goes back into the queue. An add is only
    /// re-queued when no newer add or delete arrived for its key meanwhile.
    pub async fn flush(&self, store: &dyn PersistencePort) -> Result<usize, PersistenceError> {
        let (mut adds, deletes) = {
            let mut pending = self.pending.lock().await;
            let adds: Vec<(ItemKey, (u64, Arc<PublishedItem>))> = pending.adds.drain().collect();
            let deletes: Vec<ItemKey> = pending.deletes.drain().collect();
            pending.record_depth();
            (adds, deletes)
        };
        if adds.is_empty() && deletes.is_empty() {
            return Ok(0);
        }
        adds.sort_by_key(|(_, (seq, _))| *seq);
        let stored: Vec<StoredItem> = adds.iter().map(|(_, (_, item))| item.to_stored()).collect();
        let count = stored.len() + deletes.len();

        let start = Instant::now();
        let result = store.flush_pending_items(&stored, &deletes).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::record_flush_latency(latency_ms, result.is_ok());

        match result {
            Ok(()) => {
                debug!(
                    adds = stored.len(),
                    deletes = deletes.len(),
                    latency_ms,
                    "Flushed pending items"
                );
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, adds = stored.len(), deletes = deletes.len(), "Item flush failed, re-queueing");
                let mut pending = self.pending.lock().await;
                for (key, entry) in adds {
                    if !pending.adds.contains_key(&key) && !pending.deletes.contains(&key) {
                        pending.adds.insert(key, entry);
                    }
                }
                for key in deletes {
                    pending.deletes.insert(key);
                }
                pending.record_depth();
                Err(e)
            }
        }
    }

    /// Flush every `interval` and whenever the queue reaches its threshold,
    /// until `cancel` fires.
    pub fn spawn_flush_task(
        self: Arc<Self>,
        store: Arc<dyn PersistencePort>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = self.flush_needed.notified() => {}
                }
                // Errors are logged and the batch re-queued by `flush`.
                let _ = self.flush(store.as_ref()).await;
            }
            debug!("Item flush task stopped");
        })
    }
}
