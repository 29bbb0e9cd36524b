//! Module handler registry
//!
//! Step work is delegated to pluggable handlers keyed by module id. The
//! registry is the only place handlers are looked up; a step referencing an
//! unregistered module is a deployment configuration defect, not a runtime
//! hiccup, and is reported as such.

use crate::domain::flow_definition::{ModuleId, StepId};
use crate::domain::runtime_state::{CorrelationId, ExecutionId};
use crate::error::EngineError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Read-only execution facts handed to a handler alongside its input
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Execution the step belongs to
    pub execution_id: ExecutionId,

    /// Correlation identifier for external event matching
    pub correlation_id: CorrelationId,

    /// Step being executed
    pub step: StepId,

    /// 1-based attempt number at this step
    pub attempt: u32,
}

/// A pluggable unit of step work.
///
/// Handlers receive the fully mapped, hydrated input object plus read-only
/// execution facts, and return a raw output object for the step's output
/// mappings to pick apart. Handlers must be pure with respect to flow
/// execution: everything they produce flows out through the returned value.
#[async_trait]
pub trait ModuleHandler: Send + Sync {
    /// Identifier steps use to reference this handler
    fn module_id(&self) -> ModuleId;

    /// Execute the module against a mapped input object
    async fn invoke(&self, input: Value, ctx: &StepContext) -> Result<Value, EngineError>;
}

/// Thread-safe lookup table of module handlers
#[derive(Default)]
pub struct ModuleRegistry {
    handlers: DashMap<String, Arc<dyn ModuleHandler>>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own module id. Re-registering an id
    /// replaces the previous handler.
    pub fn register(&self, handler: Arc<dyn ModuleHandler>) {
        let id = handler.module_id();
        if self.handlers.insert(id.0.clone(), handler).is_some() {
            tracing::warn!(module_id = %id, "Replaced existing module handler");
        } else {
            tracing::debug!(module_id = %id, "Registered module handler");
        }
    }

    /// Look up a handler by module id
    pub fn get(&self, id: &ModuleId) -> Result<Arc<dyn ModuleHandler>, EngineError> {
        self.handlers
            .get(&id.0)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::ModuleNotFound(id.0.clone()))
    }

    /// Whether a handler is registered for the id
    pub fn contains(&self, id: &ModuleId) -> bool {
        self.handlers.contains_key(&id.0)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for dyn ModuleHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ModuleHandler").field(&self.module_id().0).finish()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
