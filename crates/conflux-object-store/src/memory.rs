//! In-memory implementation of ObjectStore
//!
//! Content-addressed: the key is the SHA-256 digest of the bytes, so put is
//! naturally idempotent. Primarily intended for testing and development; all
//! data is lost when the instance is dropped.

use crate::{ObjectKey, ObjectStore, ObjectStoreError, ObjectStoreResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory, content-addressed object store
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    /// Create a new in-memory object store
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Calculate the content key for a byte slice
    fn calculate_key(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    /// Number of objects currently stored
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether the store holds no objects
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, bytes: &[u8]) -> ObjectStoreResult<ObjectKey> {
        let key = Self::calculate_key(bytes);
        let mut store = self.objects.write().await;
        store.entry(key.clone()).or_insert_with(|| bytes.to_vec());

        tracing::debug!(key = %key, size = bytes.len(), "Stored object");
        Ok(ObjectKey::new_unchecked(key))
    }

    async fn get(&self, key: &ObjectKey) -> ObjectStoreResult<Vec<u8>> {
        let store = self.objects.read().await;
        store
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.clone()))
    }

    async fn exists(&self, key: &ObjectKey) -> ObjectStoreResult<bool> {
        let store = self.objects.read().await;
        Ok(store.contains_key(key.as_str()))
    }
}
