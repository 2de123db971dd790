//! Shared in-memory object store for integration tests.

use async_trait::async_trait;
use bytes::Bytes;
use shardfs::store::{ObjectInfo, ObjectStore};
use shardfs::{FsError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// In-memory [`ObjectStore`] with ranged-read semantics matching S3:
/// a range starting past the end of the object is an error, a range
/// running past the end is truncated.
pub struct MemoryStore {
    objects: HashMap<String, Vec<u8>>,
    served: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            served: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn with_object(mut self, key: &str, data: Vec<u8>) -> Self {
        self.objects.insert(key.to_string(), data);
        self
    }

    /// Make every `get_range` wait for a permit from the returned semaphore.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Keys served so far, in completion-start order.
    pub fn served(&self) -> Vec<String> {
        self.served.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| FsError::Store("gate closed".to_string()))?;
            permit.forget();
        }

        self.served.lock().unwrap().push(key.to_string());

        let data = self
            .objects
            .get(key)
            .ok_or_else(|| FsError::Store(format!("no such key: {}", key)))?;

        let start = offset as usize;
        if start >= data.len() {
            return Err(FsError::Store(format!(
                "range {}.. not satisfiable for {} ({} bytes)",
                offset,
                key,
                data.len()
            )));
        }
        let end = ((offset + len) as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn list_objects(&self) -> Result<Vec<ObjectInfo>> {
        let mut objects: Vec<ObjectInfo> = self
            .objects
            .iter()
            .map(|(key, data)| ObjectInfo {
                key: key.clone(),
                size: data.len() as u64,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}
