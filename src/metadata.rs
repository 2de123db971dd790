//! File Metadata Module
//!
//! Key ↔ inode/size bookkeeping backing `getattr`, `readdir`, and `open`.
//! Seeded from the mount-time object listing; keys first seen via `open`
//! fall back to a placeholder size until a real size is known.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size reported for keys opened before their real size is known: 1 GiB.
pub const PLACEHOLDER_SIZE: u64 = 1024 * 1024 * 1024;

/// Inode of the filesystem root.
pub const ROOT_INODE: u64 = 1;

/// Per-file metadata record.
#[derive(Debug, Clone, Copy)]
pub struct FileMeta {
    pub ino: u64,
    pub size: u64,
}

/// Concurrent key ↔ inode map with monotonically assigned inode numbers.
pub struct MetadataMap {
    by_key: DashMap<String, FileMeta>,
    by_ino: DashMap<u64, String>,
    next_ino: AtomicU64,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self {
            by_key: DashMap::new(),
            by_ino: DashMap::new(),
            next_ino: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    /// Register `key` with `size` if absent; an existing record wins.
    /// Returns the key's inode either way.
    pub fn register(&self, key: &str, size: u64) -> u64 {
        let meta = self.by_key.entry(key.to_string()).or_insert_with(|| {
            let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
            self.by_ino.insert(ino, key.to_string());
            FileMeta { ino, size }
        });
        meta.ino
    }

    pub fn get(&self, key: &str) -> Option<FileMeta> {
        self.by_key.get(key).map(|m| *m)
    }

    pub fn key_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).map(|k| k.clone())
    }

    /// All registered entries in key order, for stable directory listings.
    pub fn entries(&self) -> Vec<(String, FileMeta)> {
        let mut entries: Vec<(String, FileMeta)> = self
            .by_key
            .iter()
            .map(|item| (item.key().clone(), *item.value()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

impl Default for MetadataMap {
    fn default() -> Self {
        Self::new()
    }
}
