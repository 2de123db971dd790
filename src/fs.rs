//! Filesystem Module
//!
//! The FUSE bridge: a flat, read-only view of the object-store prefix at
//! the mount root. Kernel callbacks run on FUSE threads and enter the tokio
//! runtime with `Handle::block_on` for anything that touches the network.
//!
//! Also defines [`MountContext`], the process-wide value owning the cache,
//! fetcher pool, predictor, and read engine for the mount's lifetime.

use crate::cache::ChunkCache;
use crate::config::Config;
use crate::fetcher::FetcherPool;
use crate::metadata::{MetadataMap, PLACEHOLDER_SIZE, ROOT_INODE};
use crate::predictor::Predictor;
use crate::reader::ReadEngine;
use crate::store::ObjectStore;
use crate::{FsError, Result};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, Request,
};
use std::ffi::OsStr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

/// Kernel attribute cache TTL.
const ATTR_TTL: Duration = Duration::from_secs(300);

/// Owns the read-path components for the lifetime of a mount.
pub struct MountContext {
    pub config: Config,
    pub store: Arc<dyn ObjectStore>,
    pub cache: Arc<ChunkCache>,
    pub fetcher: Arc<FetcherPool>,
    pub predictor: Arc<Predictor>,
    pub engine: ReadEngine,
    pub metadata: Arc<MetadataMap>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl MountContext {
    pub fn new(config: Config, store: Arc<dyn ObjectStore>) -> Arc<Self> {
        let cache = Arc::new(ChunkCache::new(config.cache_size));
        let fetcher = Arc::new(FetcherPool::new(
            store.clone(),
            cache.clone(),
            config.workers,
        ));
        let predictor = Arc::new(Predictor::new(
            cache.clone(),
            fetcher.clone(),
            config.lookahead,
        ));
        let engine = ReadEngine::new(cache.clone(), fetcher.clone(), predictor.clone());

        Arc::new(Self {
            config,
            store,
            cache,
            fetcher,
            predictor,
            engine,
            metadata: Arc::new(MetadataMap::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Seed the metadata map from an object listing so directory entries
    /// carry real sizes. Best-effort; the mount works without it.
    pub async fn bootstrap_metadata(&self) -> Result<usize> {
        let objects = self.store.list_objects().await?;
        let count = objects.len();
        for obj in objects {
            self.metadata.register(&obj.key, obj.size);
        }
        info!(objects = count, "metadata seeded from object listing");
        Ok(count)
    }

    /// Start the fetcher workers and the predictor. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fetcher.start();
        self.predictor.start();
        info!("mount context started");
    }

    /// Stop the predictor, then the fetcher pool, and log final statistics.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.predictor.stop().await;
        self.fetcher.shutdown().await;

        let cache = self.cache.stats();
        let predictor = self.predictor.stats();
        info!(
            cached_bytes = cache.current_size,
            cached_files = cache.num_files,
            predictions = predictor.predictions_made,
            prefetches = predictor.prefetches_issued,
            "mount context stopped"
        );
    }
}

/// Read-only FUSE filesystem over the mount context.
pub struct ShardFs {
    ctx: Arc<MountContext>,
    runtime: Handle,
    next_fh: AtomicU64,
}

impl ShardFs {
    /// Create the filesystem. Must be called from within a tokio runtime.
    pub fn new(ctx: Arc<MountContext>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| FsError::Mount(format!("no tokio runtime: {}", e)))?;
        Ok(Self {
            ctx,
            runtime,
            next_fh: AtomicU64::new(1),
        })
    }

    fn root_attr(&self) -> FileAttr {
        FileAttr {
            ino: ROOT_INODE,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn file_attr(&self, ino: u64, size: u64) -> FileAttr {
        FileAttr {
            ino,
            size,
            blocks: (size + 511) / 512,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o444,
            nlink: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for ShardFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        self.ctx.start();
        Ok(())
    }

    fn destroy(&mut self) {
        let ctx = self.ctx.clone();
        self.runtime.block_on(async move {
            ctx.stop().await;
        });
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INODE {
            reply.error(libc::ENOENT);
            return;
        }

        let name = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.ctx.metadata.get(name) {
            Some(meta) => reply.entry(&ATTR_TTL, &self.file_attr(meta.ino, meta.size), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INODE {
            reply.attr(&ATTR_TTL, &self.root_attr());
            return;
        }

        match self
            .ctx
            .metadata
            .key_of(ino)
            .and_then(|key| self.ctx.metadata.get(&key))
        {
            Some(meta) => reply.attr(&ATTR_TTL, &self.file_attr(meta.ino, meta.size)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INODE {
            reply.error(libc::ENOENT);
            return;
        }

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ROOT_INODE, FileType::Directory, ".".to_string()),
            (ROOT_INODE, FileType::Directory, "..".to_string()),
        ];
        for (key, meta) in self.ctx.metadata.entries() {
            entries.push((meta.ino, FileType::RegularFile, key));
        }

        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        if ino == ROOT_INODE {
            reply.error(libc::EISDIR);
            return;
        }

        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EACCES);
            return;
        }

        let key = match self.ctx.metadata.key_of(ino) {
            Some(key) => key,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        // Keys can surface here before any listing covered them; make sure
        // an entry exists so reads have a size to clamp against.
        self.ctx.metadata.register(&key, PLACEHOLDER_SIZE);
        self.ctx.predictor.on_access(&key);

        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        let key = match self.ctx.metadata.key_of(ino) {
            Some(key) => key,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let offset = offset as u64;

        let file_size = self
            .ctx
            .metadata
            .get(&key)
            .map(|m| m.size)
            .unwrap_or(PLACEHOLDER_SIZE);
        if offset >= file_size {
            reply.data(&[]);
            return;
        }
        let len = (size as u64).min(file_size - offset) as usize;

        let ctx = self.ctx.clone();
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.runtime
                .block_on(async move { ctx.engine.read(&key, offset, len).await })
        }));

        match result {
            Ok(Ok(data)) => reply.data(&data),
            Ok(Err(e)) => {
                warn!(error = %e, "read failed");
                reply.error(e.errno());
            }
            Err(_) => {
                error!("read handler panicked");
                reply.error(libc::EIO);
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }
}

/// Mount in the background; unmounts when the returned session drops.
pub fn spawn_mount(fs: ShardFs, mountpoint: &Path) -> Result<fuser::BackgroundSession> {
    fuser::spawn_mount2(
        fs,
        mountpoint,
        &[
            MountOption::RO,
            MountOption::FSName("shardfs".into()),
            MountOption::AutoUnmount,
        ],
    )
    .map_err(|e| FsError::Mount(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectInfo;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct ListingStore {
        objects: Vec<ObjectInfo>,
    }

    #[async_trait]
    impl ObjectStore for ListingStore {
        async fn get_range(&self, _key: &str, _offset: u64, _len: u64) -> Result<Bytes> {
            Err(FsError::Store("unavailable".to_string()))
        }
        async fn list_objects(&self) -> Result<Vec<ObjectInfo>> {
            Ok(self.objects.clone())
        }
    }

    fn test_config() -> Config {
        Config::from_args(vec![
            "shardfs", "--mount", "/tmp/m", "--bucket", "b", "--region", "us-west-2",
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_metadata() {
        let store = Arc::new(ListingStore {
            objects: vec![
                ObjectInfo {
                    key: "shard_0001.bin".to_string(),
                    size: 100,
                },
                ObjectInfo {
                    key: "shard_0002.bin".to_string(),
                    size: 200,
                },
            ],
        });
        let ctx = MountContext::new(test_config(), store);

        let count = ctx.bootstrap_metadata().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(ctx.metadata.get("shard_0001.bin").unwrap().size, 100);
        assert_eq!(ctx.metadata.get("shard_0002.bin").unwrap().size, 200);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let store = Arc::new(ListingStore { objects: vec![] });
        let ctx = MountContext::new(test_config(), store);

        ctx.start();
        ctx.start();
        ctx.stop().await;
        ctx.stop().await;
    }
}
