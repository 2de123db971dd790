//! Object Store Module
//!
//! Abstracts the object store behind a narrow async trait so the fetcher
//! pool and the tests do not depend on AWS. The production implementation
//! wraps the S3 SDK with ranged GETs and paginated listing.

use crate::{FsError, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, warn};

/// A listed object: relative key (prefix stripped) and size in bytes.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Read-only view of an object-store prefix.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch `[offset, offset + len)` of `key`. A range reaching past the
    /// end of the object returns the bytes up to the end (a short read).
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Enumerate objects under the configured prefix, keys relative to it.
    async fn list_objects(&self) -> Result<Vec<ObjectInfo>>;
}

/// S3-backed [`ObjectStore`] for one bucket + optional key prefix.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStore {
    /// Connect using the default credential provider chain.
    pub async fn connect(bucket: &str, region: &str, prefix: &str) -> Self {
        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Self {
            client: Client::new(&shared_config),
            bucket: bucket.to_string(),
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn relative_key<'a>(&self, full_key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            full_key
        } else {
            full_key
                .strip_prefix(&self.prefix)
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(full_key)
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        let full_key = self.full_key(key);
        // Inclusive HTTP byte range.
        let range = format!("bytes={}-{}", offset, offset + len - 1);

        debug!(key = %full_key, %range, "S3 GetObject");

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .range(range)
            .send()
            .await
            .map_err(|e| FsError::Store(format!("GetObject {}: {}", full_key, e)))?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| FsError::Store(format!("GetObject body {}: {}", full_key, e)))?
            .into_bytes();

        Ok(data)
    }

    async fn list_objects(&self) -> Result<Vec<ObjectInfo>> {
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket);
            if !self.prefix.is_empty() {
                req = req.prefix(format!("{}/", self.prefix));
            }
            if let Some(ref token) = continuation_token {
                req = req.continuation_token(token);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| FsError::Store(format!("ListObjectsV2: {}", e)))?;

            if let Some(contents) = resp.contents {
                for obj in contents {
                    let full_key = obj.key.unwrap_or_default();
                    // Skip directory markers and empty keys
                    if full_key.is_empty() || full_key.ends_with('/') {
                        continue;
                    }
                    let key = self.relative_key(&full_key).to_string();
                    results.push(ObjectInfo {
                        key,
                        size: obj.size.unwrap_or(0) as u64,
                    });
                }
            }

            if resp.is_truncated == Some(true) {
                continuation_token = resp.next_continuation_token;
                if continuation_token.is_none() {
                    warn!("S3 listing truncated without a continuation token");
                    break;
                }
            } else {
                break;
            }
        }

        Ok(results)
    }
}
