//! Task Queue Module
//!
//! A multi-producer / multi-consumer priority queue feeding the fetcher
//! workers. Three priority bands with FIFO order inside each band, a soft
//! capacity cap for speculative work, and idempotent shutdown that wakes
//! every blocked consumer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Soft cap on queued speculative (non-urgent) tasks.
pub const MAX_PREFETCH_QUEUE_SIZE: usize = 100;

/// Priority bands for fetch tasks. Higher compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Lookahead tail (N+2, N+3, ...)
    Background,
    /// Predicted next file
    Normal,
    /// On-demand miss, a reader is blocked on it
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "URGENT",
            Priority::Normal => "NORMAL",
            Priority::Background => "BACKGROUND",
        }
    }
}

struct QueueItem<T> {
    data: T,
    priority: Priority,
    seq: u64,
}

impl<T> PartialEq for QueueItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for QueueItem<T> {}

impl<T> PartialOrd for QueueItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueItem<T> {
    // Max-heap: highest priority first, then lowest sequence number (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Thread-safe priority queue with blocking pop and graceful shutdown.
pub struct PriorityQueue<T> {
    heap: Mutex<BinaryHeap<QueueItem<T>>>,
    notify: Notify,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        }
    }

    /// Enqueue an item.
    ///
    /// Returns `false` without enqueueing when the queue has been shut down,
    /// or when a non-urgent item would push the queue past the speculative
    /// cap. Urgent items are always accepted while the queue is open.
    pub fn push(&self, data: T, priority: Priority) -> bool {
        if self.shutdown.load(AtomicOrdering::SeqCst) {
            return false;
        }

        {
            let mut heap = self.heap.lock().unwrap();
            if priority != Priority::Urgent && heap.len() >= MAX_PREFETCH_QUEUE_SIZE {
                return false;
            }
            let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
            heap.push(QueueItem {
                data,
                priority,
                seq,
            });
        }

        self.notify.notify_one();
        true
    }

    /// Remove and return the highest-priority item, blocking while the queue
    /// is empty. Returns `None` once shutdown has been signaled and the queue
    /// is drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            // Register interest before checking, so a push between the check
            // and the await leaves a stored permit instead of a lost wakeup.
            let notified = self.notify.notified();

            {
                let mut heap = self.heap.lock().unwrap();
                if let Some(item) = heap.pop() {
                    // Pass the permit along for any sibling consumer.
                    if !heap.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item.data);
                }
                if self.shutdown.load(AtomicOrdering::SeqCst) {
                    drop(heap);
                    // Cascade so consumers that raced the shutdown signal
                    // find a stored permit when they reach their await.
                    self.notify.notify_one();
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.heap.lock().unwrap().pop().map(|item| item.data)
    }

    /// Signal shutdown and wake all blocked consumers. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
        // One stored permit starts the wake cascade for consumers that had
        // not yet registered when notify_waiters ran.
        self.notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(AtomicOrdering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().is_empty()
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
