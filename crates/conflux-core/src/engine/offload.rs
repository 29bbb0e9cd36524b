//! Large-payload indirection
//!
//! Payloads above a configured size threshold are swapped for a
//! `PayloadPointer` into the external object store before they are embedded
//! in mapped input or output, keeping the running context small. The mapping
//! engine hydrates pointers back transparently before a step sees its input.

use crate::error::EngineError;
use conflux_object_store::{ObjectKey, ObjectStore};
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Marker key identifying a pointer object in a JSON tree
pub const POINTER_KEY: &str = "$payloadRef";

/// Marker object substituted for an offloaded payload:
/// `{ "$payloadRef": "<object key>" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadPointer {
    /// Location of the payload in the external object store
    #[serde(rename = "$payloadRef")]
    pub location: String,
}

impl PayloadPointer {
    /// Interpret a JSON value as a pointer. Only an object whose sole key is
    /// the marker counts; ordinary data containing the marker alongside other
    /// fields is left alone.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        let location = map.get(POINTER_KEY)?.as_str()?;
        Some(Self {
            location: location.to_string(),
        })
    }

    /// The pointer's JSON representation
    pub fn to_value(&self) -> Value {
        serde_json::json!({ POINTER_KEY: self.location })
    }
}

/// Offloads large payloads to the object store and hydrates pointers back
pub struct PayloadOffloader {
    store: Arc<dyn ObjectStore>,
    threshold_bytes: usize,
}

impl PayloadOffloader {
    /// Create an offloader with the given size threshold
    pub fn new(store: Arc<dyn ObjectStore>, threshold_bytes: usize) -> Self {
        Self {
            store,
            threshold_bytes,
        }
    }

    /// The configured size threshold in bytes
    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    /// Replace `value` with a pointer when its serialized size exceeds the
    /// threshold; smaller values pass through unchanged.
    pub async fn maybe_offload(&self, value: Value) -> Result<Value, EngineError> {
        let bytes = serde_json::to_vec(&value)?;
        if bytes.len() <= self.threshold_bytes {
            return Ok(value);
        }

        let key = self.store.put(&bytes).await?;
        tracing::debug!(
            key = %key,
            size = bytes.len(),
            threshold = self.threshold_bytes,
            "Offloaded payload to object store"
        );

        Ok(PayloadPointer {
            location: key.into_string(),
        }
        .to_value())
    }

    /// Recursively replace every pointer in `value` with its dereferenced
    /// content. Sibling pointers hydrate in parallel; order is irrelevant
    /// because dereferencing is idempotent and never mutates the stored
    /// object. A failed dereference is transient: the store may be
    /// eventually consistent.
    pub async fn hydrate(&self, value: Value) -> Result<Value, EngineError> {
        self.hydrate_value(value).await
    }

    fn hydrate_value(&self, value: Value) -> BoxFuture<'_, Result<Value, EngineError>> {
        async move {
            if let Some(pointer) = PayloadPointer::from_value(&value) {
                let fetched = self.dereference(&pointer).await?;
                // Stored payloads may themselves embed pointers
                return self.hydrate_value(fetched).await;
            }

            match value {
                Value::Array(items) => {
                    let hydrated =
                        try_join_all(items.into_iter().map(|item| self.hydrate_value(item)))
                            .await?;
                    Ok(Value::Array(hydrated))
                }
                Value::Object(map) => {
                    let (keys, values): (Vec<String>, Vec<Value>) = map.into_iter().unzip();
                    let hydrated =
                        try_join_all(values.into_iter().map(|item| self.hydrate_value(item)))
                            .await?;
                    Ok(Value::Object(keys.into_iter().zip(hydrated).collect()))
                }
                other => Ok(other),
            }
        }
        .boxed()
    }

    async fn dereference(&self, pointer: &PayloadPointer) -> Result<Value, EngineError> {
        let key = ObjectKey::new(pointer.location.clone())
            .map_err(|e| EngineError::Validation(format!("Invalid payload pointer: {}", e)))?;
        let bytes = self
            .store
            .get(&key)
            .await
            .map_err(|e| EngineError::Transient(format!("Payload dereference failed: {}", e)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
