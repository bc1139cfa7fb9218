//! # Bounded Change Queue
//!
//! A single fixed-capacity FIFO shared by every entity type's change stream
//! (producers) and drained by the dispatcher's worker pool (consumers).
//!
//! ```text
//! stream(users)  ──┐                       ┌──▶ worker 0
//! stream(orders) ──┼──▶ [ ■ ■ ■ □ □ □ ] ──┼──▶ worker 1
//! stream(tags)   ──┘     capacity = N      └──▶ worker 2
//! ```
//!
//! - `enqueue` blocks when full; it never drops or reorders items of one
//!   producer. A full queue is backpressure, not an error.
//! - Consumers take turns on one receiver lock, so any worker may receive
//!   any entity type's event.

use crate::common::tracker::EventSink;
use crate::common::{CdcError, ChangeEvent, PipelineMetrics, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Bounded multi-producer, multi-consumer FIFO with blocking enqueue.
pub struct BoundedQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    capacity: usize,
    stats: QueueStats,
}

/// The queue shared by the change tracker and dispatcher.
pub type ChangeQueue = BoundedQueue<ChangeEvent>;

impl<T: Send> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
            stats: QueueStats::default(),
        }
    }

    /// Enqueue an item, waiting while the queue is full.
    pub async fn enqueue(&self, item: T) -> Result<()> {
        let item = match self.tx.try_send(item) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(TrySendError::Full(item)) => {
                self.stats.blocked.fetch_add(1, Ordering::Relaxed);
                PipelineMetrics::record_enqueue_blocked();
                debug!("Change queue full ({} items), producer waiting", self.capacity);
                item
            }
            Err(TrySendError::Closed(_)) => {
                return Err(CdcError::shutdown("change queue closed"));
            }
        };

        self.tx
            .send(item)
            .await
            .map_err(|_| CdcError::shutdown("change queue closed"))?;
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue without waiting; hands the item back when full or closed.
    pub fn try_enqueue(&self, item: T) -> std::result::Result<(), TrySendError<T>> {
        let result = self.tx.try_send(item);
        match &result {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.stats.blocked.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => {}
        }
        result
    }

    /// Dequeue the next item, waiting while the queue is empty.
    pub async fn dequeue(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        let item = rx.recv().await;
        if item.is_some() {
            self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Dequeue the next item, giving up after `timeout`.
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.dequeue())
            .await
            .ok()
            .flatten()
    }

    /// Dequeue the next item and run `f` on it before the receive lock is
    /// released, so `f` observes items in exact queue order.
    pub async fn recv_with<R, F>(&self, timeout: Duration, f: F) -> Option<(T, R)>
    where
        F: FnOnce(&T) -> R,
    {
        tokio::time::timeout(timeout, async {
            let mut rx = self.rx.lock().await;
            let item = rx.recv().await?;
            self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
            let r = f(&item);
            Some((item, r))
        })
        .await
        .ok()
        .flatten()
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get statistics.
    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dequeued: self.stats.dequeued.load(Ordering::Relaxed),
            blocked: self.stats.blocked.load(Ordering::Relaxed),
            current_len: self.len(),
            capacity: self.capacity,
        }
    }
}

#[async_trait]
impl EventSink for ChangeQueue {
    async fn send(&self, event: ChangeEvent) -> Result<()> {
        let entity_type = event.entity_type.clone();
        self.enqueue(event).await?;
        PipelineMetrics::record_enqueued(&entity_type);
        PipelineMetrics::set_queue_depth(self.len());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct QueueStats {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    blocked: AtomicU64,
}

/// Snapshot of queue statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    /// Enqueue calls that found the queue full and had to wait
    pub blocked: u64,
    pub current_len: usize,
    pub capacity: usize,
}

impl QueueStatsSnapshot {
    /// Fill ratio (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.current_len as f64 / self.capacity as f64
    }
}
