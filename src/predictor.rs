//! Predictor Module
//!
//! Turns access notifications into speculative fetch work. Two prediction
//! modes: an ordered manifest of keys when one was loaded, otherwise a
//! numeric-suffix pattern on the key itself (`shard_0042.bin` predicts
//! `shard_0043.bin`, width preserved). Predicted keys already cached or
//! already in flight are suppressed; everything else is submitted to the
//! fetcher at normal priority.
//!
//! A supervisor task samples the most recent access every 50 ms and sweeps
//! completed prefetch handles out of the in-flight set.

use crate::cache::{ChunkCache, CHUNK_SIZE};
use crate::fetcher::{FetchHandle, FetcherPool};
use crate::task_queue::Priority;
use crate::{FsError, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Supervisor sampling period.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct InFlight {
    keys: HashSet<String>,
    handles: Vec<(String, FetchHandle)>,
}

#[derive(Default)]
struct PredictorCounters {
    predictions_made: AtomicU64,
    prefetches_issued: AtomicU64,
    pattern_hits: AtomicU64,
    manifest_hits: AtomicU64,
}

/// Predictor statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PredictorStats {
    pub predictions_made: u64,
    pub prefetches_issued: u64,
    pub pattern_hits: u64,
    pub manifest_hits: u64,
}

/// Access-driven prefetch supervisor.
pub struct Predictor {
    cache: Arc<ChunkCache>,
    fetcher: Arc<FetcherPool>,
    lookahead: usize,
    manifest: RwLock<Vec<String>>,
    manifest_index: RwLock<HashMap<String, usize>>,
    last_access: Mutex<Option<String>>,
    in_flight: Mutex<InFlight>,
    stop_flag: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    counters: PredictorCounters,
}

impl Predictor {
    pub fn new(cache: Arc<ChunkCache>, fetcher: Arc<FetcherPool>, lookahead: usize) -> Self {
        Self {
            cache,
            fetcher,
            lookahead,
            manifest: RwLock::new(Vec::new()),
            manifest_index: RwLock::new(HashMap::new()),
            last_access: Mutex::new(None),
            in_flight: Mutex::new(InFlight::default()),
            stop_flag: AtomicBool::new(false),
            supervisor: Mutex::new(None),
            counters: PredictorCounters::default(),
        }
    }

    /// Record that `key` was read. Cheap; called on every resolved read.
    pub fn on_access(&self, key: &str) {
        *self.last_access.lock().unwrap() = Some(key.to_string());
    }

    /// Load an ordered key manifest. Blank lines and `#` comments are
    /// ignored. Manifest mode is active only when at least one key loaded;
    /// an effectively empty file leaves pattern mode in place.
    pub fn load_manifest(&self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FsError::Manifest(format!("{}: {}", path.display(), e)))?;

        let keys: Vec<String> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();

        let mut index = HashMap::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            index.entry(key.clone()).or_insert(i);
        }

        let count = keys.len();
        *self.manifest_index.write().unwrap() = index;
        *self.manifest.write().unwrap() = keys;

        if count == 0 {
            warn!(path = %path.display(), "manifest has no usable entries, staying in pattern mode");
        } else {
            info!(path = %path.display(), entries = count, "manifest loaded");
        }
        Ok(count)
    }

    /// Spawn the supervisor task. Calling more than once is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.supervisor.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let predictor = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if predictor.stop_flag.load(Ordering::SeqCst) {
                    break;
                }

                predictor.sweep_completed();

                let current = predictor.last_access.lock().unwrap().clone();
                if let Some(key) = current {
                    predictor.predict_and_prefetch(&key);
                }
            }
        }));
        info!(lookahead = self.lookahead, "predictor started");
    }

    /// Stop the supervisor task. Idempotent.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let handle = self.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("predictor stopped");
        }
    }

    pub fn stats(&self) -> PredictorStats {
        PredictorStats {
            predictions_made: self.counters.predictions_made.load(Ordering::Relaxed),
            prefetches_issued: self.counters.prefetches_issued.load(Ordering::Relaxed),
            pattern_hits: self.counters.pattern_hits.load(Ordering::Relaxed),
            manifest_hits: self.counters.manifest_hits.load(Ordering::Relaxed),
        }
    }

    /// Successor of a key whose name ends in a digit run before its
    /// extension. Zero-padding width is preserved (`042` becomes `043`);
    /// the width grows on overflow (`999` becomes `1000`).
    pub fn predict_next_sequential(key: &str) -> Option<String> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| {
            // Non-greedy prefix so the digit run is the one directly before
            // the extension, not digits embedded earlier in the path.
            Regex::new(r"^(.*?)(\d+)(\..*)$").expect("static regex")
        });

        let caps = re.captures(key)?;
        let prefix = caps.get(1)?.as_str();
        let digits = caps.get(2)?.as_str();
        let suffix = caps.get(3)?.as_str();

        let number: u64 = digits.parse().ok()?;
        let next = number.checked_add(1)?;

        Some(format!(
            "{}{:0width$}{}",
            prefix,
            next,
            suffix,
            width = digits.len()
        ))
    }

    fn predict_and_prefetch(&self, key: &str) {
        self.counters.predictions_made.fetch_add(1, Ordering::Relaxed);

        let to_prefetch = {
            let manifest = self.manifest.read().unwrap();
            if manifest.is_empty() {
                drop(manifest);
                self.pattern_successors(key)
            } else {
                drop(manifest);
                self.manifest_successors(key)
            }
        };

        for next_key in to_prefetch {
            if self.cache.contains(&next_key) {
                continue;
            }

            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if !in_flight.keys.insert(next_key.clone()) {
                    continue;
                }
            }

            debug!(key = %next_key, "issuing prefetch");
            let handle = self.fetcher.submit(&next_key, 0, CHUNK_SIZE, Priority::Normal);
            self.in_flight
                .lock()
                .unwrap()
                .handles
                .push((next_key, handle));
            self.counters.prefetches_issued.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Chained pattern prediction: each successor derives from the previous.
    fn pattern_successors(&self, key: &str) -> Vec<String> {
        let mut successors = Vec::new();
        let mut current = key.to_string();
        for _ in 0..self.lookahead {
            match Self::predict_next_sequential(&current) {
                Some(next) => {
                    successors.push(next.clone());
                    current = next;
                }
                None => break,
            }
        }
        if !successors.is_empty() {
            self.counters.pattern_hits.fetch_add(1, Ordering::Relaxed);
        }
        successors
    }

    fn manifest_successors(&self, key: &str) -> Vec<String> {
        let position = match self.manifest_index.read().unwrap().get(key) {
            Some(&i) => i,
            None => return Vec::new(),
        };

        let manifest = self.manifest.read().unwrap();
        let successors: Vec<String> = (1..=self.lookahead)
            .filter_map(|j| manifest.get(position + j).cloned())
            .collect();

        if !successors.is_empty() {
            self.counters.manifest_hits.fetch_add(1, Ordering::Relaxed);
        }
        successors
    }

    /// Drop completed handles and release their keys for re-prediction.
    /// Failures are not blacklisted.
    fn sweep_completed(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let InFlight { keys, handles } = &mut *in_flight;
        handles.retain_mut(|(key, handle)| match handle.try_complete() {
            None => true,
            Some(_) => {
                keys.remove(key);
                false
            }
        });
    }

    #[cfg(test)]
    fn in_flight_keys(&self) -> HashSet<String> {
        self.in_flight.lock().unwrap().keys.clone()
    }
}
