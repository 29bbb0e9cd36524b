//! Conflux Object Store
//!
//! Abstraction over the external blob storage that the engine uses to keep
//! large payloads out of the running context. The `ObjectStore` trait defines
//! the contract; implementations are expected to provide read-after-write
//! consistency for objects they wrote within one execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

pub mod memory;

pub use memory::InMemoryObjectStore;

/// Location of a stored object, typically "sha256:<hex_digest>"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Constructor validates the expected key format
    pub fn new(key: String) -> Result<Self, ObjectStoreError> {
        // sha256: + 64 hex chars
        if !key.starts_with("sha256:") || key.len() != 71 {
            return Err(ObjectStoreError::InvalidKeyFormat(key));
        }
        Ok(Self(key))
    }

    /// Create an ObjectKey directly from a string without validation
    pub(crate) fn new_unchecked(key: String) -> Self {
        Self(key)
    }

    /// Get the string representation of the key
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during object store operations
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    /// Object not found for the given key
    #[error("Object not found for key: {0}")]
    NotFound(ObjectKey),

    /// Key string does not match the expected format
    #[error("Invalid object key format: {0}")]
    InvalidKeyFormat(String),

    /// Backend-specific failure (network, availability, quota)
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for object store operations
pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Contract for storing and retrieving opaque payload blobs
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes and return the key they can be fetched under.
    ///
    /// Storing the same bytes twice must return the same key and must not
    /// duplicate the object (put is idempotent).
    async fn put(&self, bytes: &[u8]) -> ObjectStoreResult<ObjectKey>;

    /// Fetch the bytes stored under a key.
    ///
    /// Returns `NotFound` when nothing is stored under the key. Must not
    /// mutate the stored object.
    async fn get(&self, key: &ObjectKey) -> ObjectStoreResult<Vec<u8>>;

    /// Check whether an object exists without fetching it
    async fn exists(&self, key: &ObjectKey) -> ObjectStoreResult<bool>;
}
