use chrono::{DateTime, Utc};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;
use uuid::Uuid;

/// Queue priority. Lower values are served first.
pub type Priority = u8;

/// Immediate.
pub const HIGHEST_PRIORITY: Priority = 0;
/// Batch work; also used for re-enqueued jobs after a restart.
pub const DEFAULT_PRIORITY: Priority = 2;
pub const LOWEST_PRIORITY: Priority = 2;

/// One scheduled attempt at a job.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    /// Insertion sequence; keeps FIFO order among equal timestamps.
    seq: u64,
    pub job_id: Uuid,
}

impl QueueEntry {
    fn key(&self) -> (Priority, DateTime<Utc>, u64) {
        (self.priority, self.enqueued_at, self.seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

/// In-process priority queue of job ids.
///
/// Re-prioritising pushes a second entry instead of reordering the first.
/// Duplicates are expected: the worker drops entries whose job is no longer
/// pending, so a stale entry costs one cheap dequeue.
#[derive(Debug, Default)]
pub struct PriorityScheduler {
    heap: Mutex<BinaryHeap<Reverse<QueueEntry>>>,
    notify: Notify,
    next_seq: AtomicU64,
    checked_out: AtomicUsize,
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue unconditionally.
    pub fn push(&self, job_id: Uuid, priority: Priority) {
        let entry = QueueEntry {
            priority,
            enqueued_at: Utc::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            job_id,
        };
        let depth = {
            let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
            heap.push(Reverse(entry));
            heap.len()
        };
        metrics::gauge!("sticker_queue_depth").set(depth as f64);
        self.notify.notify_one();
    }

    /// Wait for the most urgent entry. The entry stays checked out until
    /// [`mark_processed`](Self::mark_processed) is called.
    ///
    /// Cancel-safe: dropping the future never loses an entry.
    pub async fn pop(&self) -> QueueEntry {
        loop {
            let notified = self.notify.notified();
            if let Some(entry) = self.try_pop() {
                return entry;
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<QueueEntry> {
        let (entry, depth) = {
            let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = heap.pop().map(|Reverse(e)| e)?;
            self.checked_out.fetch_add(1, Ordering::SeqCst);
            (entry, heap.len())
        };
        metrics::gauge!("sticker_queue_depth").set(depth as f64);
        Some(entry)
    }

    /// Signal that a popped entry has been fully handled.
    pub fn mark_processed(&self) {
        let _ = self
            .checked_out
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn size(&self) -> usize {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Entries popped but not yet marked processed.
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }

    /// Nothing queued and nothing in hand.
    pub fn is_drained(&self) -> bool {
        self.is_empty() && self.checked_out() == 0
    }

    pub fn clear(&self) {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner).clear();
        metrics::gauge!("sticker_queue_depth").set(0.0);
    }
}
