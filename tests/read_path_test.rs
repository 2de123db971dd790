//! End-to-end tests for the demand read path: cache population on miss,
//! chunk stitching, zone placement, and end-of-file behavior.

mod common;

use common::MemoryStore;
use shardfs::cache::{CacheZone, ChunkCache, CHUNK_SIZE};
use shardfs::fetcher::FetcherPool;
use shardfs::predictor::Predictor;
use shardfs::reader::ReadEngine;
use std::sync::Arc;

const MIB: usize = 1024 * 1024;

fn engine_over(store: MemoryStore) -> (ReadEngine, Arc<ChunkCache>, Arc<FetcherPool>) {
    let cache = Arc::new(ChunkCache::new(1024 * MIB as u64));
    let fetcher = Arc::new(FetcherPool::new(Arc::new(store), cache.clone(), 4));
    fetcher.start();
    let predictor = Arc::new(Predictor::new(cache.clone(), fetcher.clone(), 3));
    let engine = ReadEngine::new(cache.clone(), fetcher.clone(), predictor);
    (engine, cache, fetcher)
}

#[tokio::test]
async fn test_single_chunk_read() {
    let content = vec![b'A'; 1024];
    let (engine, cache, _fetcher) =
        engine_over(MemoryStore::new().with_object("x", content.clone()));

    let out = engine.read("x", 0, 1024).await.unwrap();
    assert_eq!(out, content);

    let stats = cache.stats();
    assert_eq!(stats.num_files, 1);
    assert_eq!(stats.num_chunks, 1);
    assert_eq!(stats.current_size, 1024);
    assert_eq!(cache.zone_of("x").unwrap(), CacheZone::Hot);
}

#[tokio::test]
async fn test_cross_chunk_read() {
    let content: Vec<u8> = (0..6 * MIB).map(|i| (i % 251) as u8).collect();
    let (engine, cache, _fetcher) =
        engine_over(MemoryStore::new().with_object("y", content.clone()));

    let out = engine.read("y", 0, 6 * MIB).await.unwrap();
    assert_eq!(out.len(), 6 * MIB);
    assert_eq!(out, content);

    // Two chunks: a full one at 0 and a 2 MiB tail at CHUNK_SIZE.
    assert_eq!(cache.get_chunk("y", 0).unwrap().len(), CHUNK_SIZE as usize);
    assert_eq!(cache.get_chunk("y", CHUNK_SIZE).unwrap().len(), 2 * MIB);
    assert_eq!(cache.stats().num_chunks, 2);
}

#[tokio::test]
async fn test_read_spanning_chunk_boundary() {
    let content: Vec<u8> = (0..6 * MIB).map(|i| (i % 239) as u8).collect();
    let (engine, _cache, _fetcher) =
        engine_over(MemoryStore::new().with_object("y", content.clone()));

    let offset = CHUNK_SIZE as usize - 512;
    let out = engine.read("y", offset as u64, 1024).await.unwrap();
    assert_eq!(out, &content[offset..offset + 1024]);
}

#[tokio::test]
async fn test_exactly_chunk_sized_object() {
    let content: Vec<u8> = (0..CHUNK_SIZE as usize).map(|i| (i % 17) as u8).collect();
    let (engine, cache, _fetcher) =
        engine_over(MemoryStore::new().with_object("z", content.clone()));

    let out = engine.read("z", 0, CHUNK_SIZE as usize).await.unwrap();
    assert_eq!(out, content);
    assert_eq!(cache.stats().num_chunks, 1);
}

#[tokio::test]
async fn test_repeat_read_served_from_cache() {
    let content = vec![b'R'; 2048];
    let (engine, _cache, fetcher) =
        engine_over(MemoryStore::new().with_object("x", content.clone()));

    let first = engine.read("x", 0, 2048).await.unwrap();
    let downloads_after_first = fetcher.stats().total_downloads;

    let second = engine.read("x", 0, 2048).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(fetcher.stats().total_downloads, downloads_after_first);
}

#[tokio::test]
async fn test_read_beyond_eof_returns_up_to_eof_then_nothing() {
    let content = vec![b'E'; 1000];
    let (engine, _cache, _fetcher) =
        engine_over(MemoryStore::new().with_object("x", content.clone()));

    // Request far more than the object holds.
    let out = engine.read("x", 0, 5000).await.unwrap();
    assert_eq!(out.len(), 1000);

    // Further reads at the EOF offset produce nothing.
    let out = engine.read("x", 1000, 4096).await.unwrap();
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_read_at_unaligned_offset() {
    let content: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
    let (engine, _cache, _fetcher) =
        engine_over(MemoryStore::new().with_object("x", content.clone()));

    let out = engine.read("x", 1234, 100).await.unwrap();
    assert_eq!(out, &content[1234..1334]);
}

#[tokio::test]
async fn test_missing_object_surfaces_io_error() {
    let (engine, cache, fetcher) = engine_over(MemoryStore::new());

    let err = engine.read("ghost", 0, 100).await;
    assert!(err.is_err());
    assert!(!cache.contains("ghost"));
    // Urgent fetches are retried before giving up.
    assert!(fetcher.stats().failed_downloads >= 1);
}
