//! Fetcher Pool Module
//!
//! A fixed pool of workers that drains the priority queue, issues ranged
//! GETs against the object store, and populates the chunk cache. Each
//! submitted task returns a completion handle resolving to success/failure.
//! Urgent fetches (a reader is blocked) get a longer timeout and retries;
//! speculative fetches fail fast and are abandoned silently.

use crate::cache::{CacheZone, ChunkCache};
use crate::store::ObjectStore;
use crate::task_queue::{Priority, PriorityQueue};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Timeout for urgent (demand) fetches.
pub const URGENT_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for speculative fetches.
pub const PREFETCH_TIMEOUT: Duration = Duration::from_secs(3);
/// Retries after a failed urgent fetch. Speculative fetches never retry.
pub const URGENT_MAX_RETRIES: u32 = 3;

/// A single chunk download request.
struct FetchTask {
    key: String,
    offset: u64,
    size: u64,
    priority: Priority,
    done: oneshot::Sender<bool>,
}

/// Completion handle for a submitted fetch.
///
/// Resolves `true` when the chunk was stored in the cache, `false` on any
/// failure, including tasks dropped by shutdown or queue back-pressure.
pub struct FetchHandle {
    rx: oneshot::Receiver<bool>,
}

impl FetchHandle {
    /// Block until the fetch completes.
    pub async fn wait(self) -> bool {
        self.rx.await.unwrap_or(false)
    }

    /// Non-blocking completion probe: `None` while still in flight.
    pub fn try_complete(&mut self) -> Option<bool> {
        match self.rx.try_recv() {
            Ok(success) => Some(success),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(false),
        }
    }
}

#[derive(Default)]
struct FetcherCounters {
    total_downloads: AtomicU64,
    successful_downloads: AtomicU64,
    failed_downloads: AtomicU64,
    bytes_downloaded: AtomicU64,
}

/// Fetcher statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct FetcherStats {
    pub total_downloads: u64,
    pub successful_downloads: u64,
    pub failed_downloads: u64,
    pub bytes_downloaded: u64,
}

/// Worker pool downloading chunks from the object store into the cache.
pub struct FetcherPool {
    store: Arc<dyn ObjectStore>,
    cache: Arc<ChunkCache>,
    queue: PriorityQueue<FetchTask>,
    num_workers: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopping: AtomicBool,
    counters: FetcherCounters,
}

impl FetcherPool {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<ChunkCache>, num_workers: usize) -> Self {
        Self {
            store,
            cache,
            queue: PriorityQueue::new(),
            num_workers,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            counters: FetcherCounters::default(),
        }
    }

    /// Spawn the worker tasks. Calling more than once is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.lock().unwrap();
        for worker_id in 0..self.num_workers {
            let pool = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                pool.worker_loop(worker_id).await;
            }));
        }
        info!(workers = self.num_workers, "fetcher pool started");
    }

    /// Enqueue a chunk fetch and return its completion handle.
    ///
    /// After shutdown, or when the speculative queue cap rejects the task,
    /// the handle resolves `false` immediately.
    pub fn submit(&self, key: &str, offset: u64, size: u64, priority: Priority) -> FetchHandle {
        let (done, rx) = oneshot::channel();
        let task = FetchTask {
            key: key.to_string(),
            offset,
            size,
            priority,
            done,
        };

        if !self.queue.push(task, priority) {
            debug!(key, offset, "fetch task dropped (shutdown or queue full)");
        }

        FetchHandle { rx }
    }

    /// Shut down the queue and join all workers. Tasks still queued resolve
    /// their handles to `false`. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("fetcher pool shutting down");
        self.queue.shutdown();

        let workers = {
            let mut guard = self.workers.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }

        // Anything the workers never picked up resolves false via drop.
        while self.queue.try_pop().is_some() {}

        let stats = self.stats();
        info!(
            total = stats.total_downloads,
            ok = stats.successful_downloads,
            failed = stats.failed_downloads,
            bytes = stats.bytes_downloaded,
            "fetcher pool stopped"
        );
    }

    pub fn stats(&self) -> FetcherStats {
        FetcherStats {
            total_downloads: self.counters.total_downloads.load(Ordering::Relaxed),
            successful_downloads: self.counters.successful_downloads.load(Ordering::Relaxed),
            failed_downloads: self.counters.failed_downloads.load(Ordering::Relaxed),
            bytes_downloaded: self.counters.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    async fn worker_loop(&self, worker_id: usize) {
        debug!(worker_id, "fetcher worker started");
        while !self.stopping.load(Ordering::SeqCst) {
            let Some(task) = self.queue.pop().await else {
                break;
            };
            let success = self.download_chunk(&task).await;
            let _ = task.done.send(success);
        }
        debug!(worker_id, "fetcher worker exited");
    }

    async fn download_chunk(&self, task: &FetchTask) -> bool {
        self.counters.total_downloads.fetch_add(1, Ordering::Relaxed);

        let (timeout, retries) = if task.priority == Priority::Urgent {
            (URGENT_TIMEOUT, URGENT_MAX_RETRIES)
        } else {
            (PREFETCH_TIMEOUT, 0)
        };

        for attempt in 0..=retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 << attempt)).await;
            }

            match tokio::time::timeout(
                timeout,
                self.store.get_range(&task.key, task.offset, task.size),
            )
            .await
            {
                Ok(Ok(data)) if !data.is_empty() => {
                    let len = data.len() as u64;
                    self.cache
                        .insert_chunk(&task.key, task.offset, data, self.zone_for(task));
                    // A short body means the range ran past end of object.
                    if len < task.size {
                        self.cache.note_total_size(&task.key, task.offset + len);
                    }

                    self.counters
                        .successful_downloads
                        .fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_downloaded
                        .fetch_add(len, Ordering::Relaxed);
                    return true;
                }
                Ok(Ok(_)) => {
                    warn!(key = %task.key, offset = task.offset, "object store returned empty body");
                }
                Ok(Err(e)) => {
                    if task.priority == Priority::Urgent {
                        warn!(key = %task.key, offset = task.offset, error = %e, "urgent fetch failed");
                    } else {
                        debug!(key = %task.key, offset = task.offset, error = %e, "prefetch failed");
                    }
                }
                Err(_) => {
                    warn!(
                        key = %task.key,
                        offset = task.offset,
                        timeout_ms = timeout.as_millis() as u64,
                        priority = task.priority.as_str(),
                        "fetch timed out"
                    );
                }
            }
        }

        self.counters.failed_downloads.fetch_add(1, Ordering::Relaxed);
        false
    }

    fn zone_for(&self, task: &FetchTask) -> CacheZone {
        if task.priority == Priority::Urgent {
            CacheZone::Hot
        } else {
            CacheZone::Prefetch
        }
    }
}
