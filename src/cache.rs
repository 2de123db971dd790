//! Cache Module
//!
//! Chunk-indexed in-memory cache with two eviction zones. Files whose chunks
//! were loaded on demand (or touched at least once) live in the HOT zone and
//! are evicted LRU by their oldest chunk access; speculatively prefetched
//! files live in the PREFETCH zone and age out FIFO, so speculation that is
//! never read cannot displace the working set. A single access promotes a
//! file from PREFETCH to HOT for good.
//!
//! Locking: one global reader-writer lock guards the file map, the size
//! accounting, and the two zone lists; a per-entry reader-writer lock guards
//! each file's chunk map. Lock order is always global before entry.

use crate::{FsError, Result};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

/// Chunk granularity for caching and range fetches: 4 MiB.
pub const CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Cache zone classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheZone {
    /// At least one observed access; LRU eviction.
    Hot,
    /// Speculatively loaded, not yet accessed; FIFO eviction.
    Prefetch,
}

impl CacheZone {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheZone::Hot => "HOT",
            CacheZone::Prefetch => "PREFETCH",
        }
    }
}

/// Monotonic microseconds since process start.
fn monotonic_micros() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

struct CachedChunk {
    data: Bytes,
    last_access_us: u64,
}

struct EntryState {
    zone: CacheZone,
    known_size: Option<u64>,
    chunks: BTreeMap<u64, CachedChunk>,
}

struct FileEntry {
    state: RwLock<EntryState>,
}

impl FileEntry {
    fn new(zone: CacheZone) -> Self {
        Self {
            state: RwLock::new(EntryState {
                zone,
                known_size: None,
                chunks: BTreeMap::new(),
            }),
        }
    }

    fn payload_size(&self) -> u64 {
        let state = self.state.read().unwrap();
        state.chunks.values().map(|c| c.data.len() as u64).sum()
    }

    fn oldest_access_us(&self) -> u64 {
        let state = self.state.read().unwrap();
        state
            .chunks
            .values()
            .map(|c| c.last_access_us)
            .min()
            .unwrap_or(0)
    }
}

struct CacheState {
    current_size: u64,
    files: HashMap<String, Arc<FileEntry>>,
    hot_lru: VecDeque<String>,
    prefetch_fifo: VecDeque<String>,
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub hot_size: u64,
    pub prefetch_size: u64,
    pub num_files: usize,
    pub num_chunks: usize,
}

/// Two-zone chunked cache for object payloads.
pub struct ChunkCache {
    max_size: u64,
    state: RwLock<CacheState>,
}

impl ChunkCache {
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            state: RwLock::new(CacheState {
                current_size: 0,
                files: HashMap::new(),
                hot_lru: VecDeque::new(),
                prefetch_fifo: VecDeque::new(),
            }),
        }
    }

    /// Store a chunk, creating the file entry in `zone` if it does not exist
    /// yet. Evicts whole files as needed to make room first. Replacing an
    /// existing chunk swaps the payload atomically under the entry lock.
    pub fn insert_chunk(&self, key: &str, offset: u64, data: Bytes, zone: CacheZone) {
        // Empty chunks carry no information and would corrupt accounting
        // invariants; a short tail is never zero-length.
        if data.is_empty() {
            return;
        }
        let incoming = data.len() as u64;

        let mut state = self.state.write().unwrap();
        self.evict_for(&mut state, incoming);

        let entry = match state.files.get(key) {
            Some(entry) => entry.clone(),
            None => {
                let entry = Arc::new(FileEntry::new(zone));
                state.files.insert(key.to_string(), entry.clone());
                match zone {
                    CacheZone::Hot => state.hot_lru.push_back(key.to_string()),
                    CacheZone::Prefetch => state.prefetch_fifo.push_back(key.to_string()),
                }
                entry
            }
        };

        let replaced = {
            let mut es = entry.state.write().unwrap();
            es.chunks
                .insert(
                    offset,
                    CachedChunk {
                        data,
                        last_access_us: monotonic_micros(),
                    },
                )
                .map(|old| old.data.len() as u64)
        };

        if let Some(old) = replaced {
            state.current_size -= old;
        }
        state.current_size += incoming;
    }

    /// Chunk payload at `offset`, or `None` on miss. Does not update LRU
    /// state; pair with [`touch_access`](Self::touch_access) on demand reads.
    pub fn get_chunk(&self, key: &str, offset: u64) -> Option<Bytes> {
        let state = self.state.read().unwrap();
        let entry = state.files.get(key)?;
        let es = entry.state.read().unwrap();
        es.chunks.get(&offset).map(|c| c.data.clone())
    }

    /// Record an access to `(key, offset)`: refresh the chunk's access time
    /// and promote the file from PREFETCH to HOT on its first access.
    pub fn touch_access(&self, key: &str, offset: u64) {
        let mut state = self.state.write().unwrap();
        let entry = match state.files.get(key) {
            Some(entry) => entry.clone(),
            None => return,
        };

        let promote = {
            let mut es = entry.state.write().unwrap();
            if let Some(chunk) = es.chunks.get_mut(&offset) {
                chunk.last_access_us = monotonic_micros();
            }
            if es.zone == CacheZone::Prefetch {
                es.zone = CacheZone::Hot;
                true
            } else {
                false
            }
        };

        if promote {
            state.prefetch_fifo.retain(|k| k != key);
            state.hot_lru.push_back(key.to_string());
            tracing::debug!(key, "promoted to HOT zone");
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.read().unwrap().files.contains_key(key)
    }

    /// Current zone of a cached file.
    pub fn zone_of(&self, key: &str) -> Result<CacheZone> {
        let state = self.state.read().unwrap();
        let entry = state
            .files
            .get(key)
            .ok_or_else(|| FsError::NotCached(key.to_string()))?;
        let zone = entry.state.read().unwrap().zone;
        Ok(zone)
    }

    /// Total object size for `key`, once learned from a short tail fetch.
    pub fn known_size(&self, key: &str) -> Option<u64> {
        let state = self.state.read().unwrap();
        let entry = state.files.get(key)?;
        let size = entry.state.read().unwrap().known_size;
        size
    }

    /// Record the total object size, learned when a range fetch comes back
    /// short of the requested length.
    pub fn note_total_size(&self, key: &str, total: u64) {
        let state = self.state.read().unwrap();
        if let Some(entry) = state.files.get(key) {
            entry.state.write().unwrap().known_size = Some(total);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read().unwrap();
        let mut hot_size = 0;
        let mut prefetch_size = 0;
        let mut num_chunks = 0;

        for entry in state.files.values() {
            let es = entry.state.read().unwrap();
            let size: u64 = es.chunks.values().map(|c| c.data.len() as u64).sum();
            num_chunks += es.chunks.len();
            match es.zone {
                CacheZone::Hot => hot_size += size,
                CacheZone::Prefetch => prefetch_size += size,
            }
        }

        CacheStats {
            current_size: state.current_size,
            max_size: self.max_size,
            hot_size,
            prefetch_size,
            num_files: state.files.len(),
            num_chunks,
        }
    }

    /// Snapshot of the zone lists in eviction order (prefetch FIFO head
    /// first, hot LRU front first). For diagnostics and tests.
    pub fn zone_lists(&self) -> (Vec<String>, Vec<String>) {
        let state = self.state.read().unwrap();
        (
            state.hot_lru.iter().cloned().collect(),
            state.prefetch_fifo.iter().cloned().collect(),
        )
    }

    /// Evict whole files until `incoming` more bytes fit. PREFETCH ages out
    /// first in insertion order; HOT falls back to LRU by oldest chunk
    /// access, FIFO order breaking ties. An insertion larger than the whole
    /// cache is still accepted after everything else is gone.
    fn evict_for(&self, state: &mut CacheState, incoming: u64) {
        while state.current_size + incoming > self.max_size {
            if let Some(key) = state.prefetch_fifo.pop_front() {
                Self::remove_entry(state, &key);
            } else if let Some(key) = Self::pick_hot_victim(state) {
                state.hot_lru.retain(|k| k != &key);
                Self::remove_entry(state, &key);
            } else {
                break;
            }
        }
    }

    fn pick_hot_victim(state: &CacheState) -> Option<String> {
        let mut victim: Option<(&str, u64)> = None;
        for key in &state.hot_lru {
            let Some(entry) = state.files.get(key) else {
                continue;
            };
            let oldest = entry.oldest_access_us();
            // Strict comparison keeps the earlier list position on ties.
            if victim.map_or(true, |(_, best)| oldest < best) {
                victim = Some((key, oldest));
            }
        }
        victim.map(|(key, _)| key.to_string())
    }

    fn remove_entry(state: &mut CacheState, key: &str) {
        if let Some(entry) = state.files.remove(key) {
            let freed = entry.payload_size();
            state.current_size -= freed;
            tracing::debug!(key, freed, "evicted file from cache");
        }
    }
}
