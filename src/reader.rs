//! Read Orchestrator Module
//!
//! Entry point for every read on the mount: translates byte offsets to
//! chunk-aligned cache probes, blocks on an urgent fetch on miss, records
//! the access for LRU and prediction, and stitches reads that span chunk
//! boundaries.

use crate::cache::{ChunkCache, CHUNK_SIZE};
use crate::fetcher::FetcherPool;
use crate::predictor::Predictor;
use crate::task_queue::Priority;
use crate::{FsError, Result};
use std::sync::Arc;
use tracing::debug;

/// Binds cache, fetcher, and predictor into the demand read path.
pub struct ReadEngine {
    cache: Arc<ChunkCache>,
    fetcher: Arc<FetcherPool>,
    predictor: Arc<Predictor>,
}

impl ReadEngine {
    pub fn new(
        cache: Arc<ChunkCache>,
        fetcher: Arc<FetcherPool>,
        predictor: Arc<Predictor>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            predictor,
        }
    }

    /// Read up to `len` bytes of `key` starting at `offset`.
    ///
    /// Returns fewer bytes than requested only at end of object. A read that
    /// cannot produce its first chunk fails with [`FsError::FetchFailed`];
    /// once bytes have been copied, a downstream failure ends the read short
    /// instead of discarding them.
    pub async fn read(&self, key: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len.min(CHUNK_SIZE as usize));
        let mut pos = offset;
        let mut remaining = len;
        let mut notified = false;

        while remaining > 0 {
            if let Some(total) = self.cache.known_size(key) {
                if pos >= total {
                    break;
                }
            }

            let chunk_off = pos - pos % CHUNK_SIZE;
            let in_chunk = (pos - chunk_off) as usize;

            let chunk = match self.cache.get_chunk(key, chunk_off) {
                Some(chunk) => chunk,
                None => {
                    debug!(key, chunk_off, "cache miss, issuing urgent fetch");
                    let ok = self
                        .fetcher
                        .submit(key, chunk_off, CHUNK_SIZE, Priority::Urgent)
                        .wait()
                        .await;

                    let fetched = if ok {
                        self.cache.get_chunk(key, chunk_off)
                    } else {
                        None
                    };

                    match fetched {
                        Some(chunk) => chunk,
                        None if out.is_empty() => {
                            return Err(FsError::FetchFailed(format!(
                                "{} at offset {}",
                                key, chunk_off
                            )));
                        }
                        // Bytes already copied: end the read at the failure
                        // boundary rather than discarding them.
                        None => break,
                    }
                }
            };

            self.cache.touch_access(key, chunk_off);
            if !notified {
                self.predictor.on_access(key);
                notified = true;
            }

            let available = chunk.len().saturating_sub(in_chunk);
            let n = remaining.min(available);
            if n == 0 {
                // Offset points past the end of a short tail chunk.
                break;
            }

            out.extend_from_slice(&chunk[in_chunk..in_chunk + n]);
            pos += n as u64;
            remaining -= n;

            if (chunk.len() as u64) < CHUNK_SIZE {
                // Short chunk is the object's tail; nothing follows it.
                break;
            }
        }

        Ok(out)
    }
}
