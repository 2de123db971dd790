//! Integration tests for access-driven prefetching: pattern mode, manifest
//! mode, duplicate suppression, and urgent-over-speculative scheduling.

mod common;

use common::MemoryStore;
use shardfs::cache::{CacheZone, ChunkCache, CHUNK_SIZE};
use shardfs::fetcher::FetcherPool;
use shardfs::predictor::Predictor;
use shardfs::task_queue::Priority;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn shard(n: u32) -> String {
    format!("shard_{:04}.bin", n)
}

fn stack(
    store: MemoryStore,
    workers: usize,
    lookahead: usize,
) -> (Arc<ChunkCache>, Arc<FetcherPool>, Arc<Predictor>) {
    let cache = Arc::new(ChunkCache::new(256 * 1024 * 1024));
    let fetcher = Arc::new(FetcherPool::new(Arc::new(store), cache.clone(), workers));
    fetcher.start();
    let predictor = Arc::new(Predictor::new(cache.clone(), fetcher.clone(), lookahead));
    predictor.start();
    (cache, fetcher, predictor)
}

#[tokio::test]
async fn test_pattern_prefetch_of_successor_shards() {
    let mut store = MemoryStore::new();
    for n in 42..=50 {
        store = store.with_object(&shard(n), vec![n as u8; 1024]);
    }
    let (cache, fetcher, predictor) = stack(store, 4, 3);

    predictor.on_access(&shard(42));

    let arrived = wait_until(Duration::from_secs(2), || {
        [43, 44, 45].iter().all(|&n| cache.contains(&shard(n)))
    })
    .await;
    assert!(arrived, "successors should be prefetched within bounded time");

    // Speculative data lands in the PREFETCH zone until someone reads it.
    for n in [43, 44, 45] {
        assert_eq!(cache.zone_of(&shard(n)).unwrap(), CacheZone::Prefetch);
        assert!(cache.get_chunk(&shard(n), 0).is_some());
    }
    // Lookahead of 3 stops there.
    assert!(!cache.contains(&shard(46)));

    predictor.stop().await;
    fetcher.shutdown().await;
}

#[tokio::test]
async fn test_prefetches_not_duplicated_across_ticks() {
    let mut store = MemoryStore::new();
    for n in 42..=50 {
        store = store.with_object(&shard(n), vec![0u8; 64]);
    }
    let (cache, fetcher, predictor) = stack(store, 2, 3);

    predictor.on_access(&shard(42));
    assert!(
        wait_until(Duration::from_secs(2), || {
            [43, 44, 45].iter().all(|&n| cache.contains(&shard(n)))
        })
        .await
    );

    // Let several more predictor ticks run against the same access.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = fetcher.stats();
    assert_eq!(
        stats.total_downloads, 3,
        "each predicted key must be fetched exactly once"
    );

    predictor.stop().await;
    fetcher.shutdown().await;
}

#[tokio::test]
async fn test_unnumbered_key_yields_no_prefetch() {
    let store = MemoryStore::new().with_object("weights.ckpt", vec![1u8; 64]);
    let (_cache, fetcher, predictor) = stack(store, 1, 3);

    predictor.on_access("weights.ckpt");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(fetcher.stats().total_downloads, 0);
    predictor.stop().await;
    fetcher.shutdown().await;
}

#[tokio::test]
async fn test_manifest_mode_overrides_pattern() {
    let store = MemoryStore::new()
        .with_object("first.dat", vec![1u8; 32])
        .with_object("second.dat", vec![2u8; 32])
        .with_object("third.dat", vec![3u8; 32])
        .with_object("fourth.dat", vec![4u8; 32]);
    let (cache, fetcher, predictor) = stack(store, 2, 2);

    let mut manifest = tempfile::NamedTempFile::new().unwrap();
    writeln!(manifest, "# read order").unwrap();
    writeln!(manifest, "first.dat").unwrap();
    writeln!(manifest, "second.dat").unwrap();
    writeln!(manifest, "third.dat").unwrap();
    writeln!(manifest, "fourth.dat").unwrap();
    manifest.flush().unwrap();
    assert_eq!(predictor.load_manifest(manifest.path()).unwrap(), 4);

    predictor.on_access("first.dat");

    assert!(
        wait_until(Duration::from_secs(2), || {
            cache.contains("second.dat") && cache.contains("third.dat")
        })
        .await
    );
    // Lookahead 2: the fourth entry is out of range.
    assert!(!cache.contains("fourth.dat"));

    predictor.stop().await;
    fetcher.shutdown().await;
}

#[tokio::test]
async fn test_urgent_scheduled_ahead_of_queued_prefetches() {
    let (mut store, gate) = MemoryStore::new().gated();
    for key in ["n1.bin", "n2.bin", "n3.bin", "urgent.bin"] {
        store = store.with_object(key, vec![9u8; 64]);
    }
    // Single worker so queued order is observable.
    let cache = Arc::new(ChunkCache::new(64 * 1024 * 1024));
    let store = Arc::new(store);
    let fetcher = Arc::new(FetcherPool::new(store.clone(), cache.clone(), 1));
    fetcher.start();

    // The worker takes n1 and blocks on the gate; n2/n3 stay queued.
    let n1 = fetcher.submit("n1.bin", 0, CHUNK_SIZE, Priority::Normal);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let n2 = fetcher.submit("n2.bin", 0, CHUNK_SIZE, Priority::Normal);
    let n3 = fetcher.submit("n3.bin", 0, CHUNK_SIZE, Priority::Normal);
    let urgent = fetcher.submit("urgent.bin", 0, CHUNK_SIZE, Priority::Urgent);

    gate.add_permits(4);

    assert!(n1.wait().await);
    assert!(urgent.wait().await);
    assert!(n2.wait().await);
    assert!(n3.wait().await);

    let served = store.served();
    assert_eq!(served[0], "n1.bin");
    assert_eq!(
        served[1], "urgent.bin",
        "urgent task must preempt queued speculative work"
    );

    fetcher.shutdown().await;
}

#[tokio::test]
async fn test_demand_read_may_race_prefetch_for_same_chunk() {
    let store = MemoryStore::new().with_object("shard_0001.bin", vec![5u8; 2048]);
    let cache = Arc::new(ChunkCache::new(64 * 1024 * 1024));
    let fetcher = Arc::new(FetcherPool::new(Arc::new(store), cache.clone(), 4));
    fetcher.start();

    // Same (key, offset) fetched twice concurrently at different priorities.
    let normal = fetcher.submit("shard_0001.bin", 0, CHUNK_SIZE, Priority::Normal);
    let urgent = fetcher.submit("shard_0001.bin", 0, CHUNK_SIZE, Priority::Urgent);

    assert!(normal.wait().await);
    assert!(urgent.wait().await);

    // Both inserts carry identical bytes; accounting stays exact.
    assert_eq!(cache.get_chunk("shard_0001.bin", 0).unwrap().len(), 2048);
    assert_eq!(cache.stats().current_size, 2048);

    fetcher.shutdown().await;
}
