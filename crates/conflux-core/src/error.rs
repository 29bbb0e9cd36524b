use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure family used by the retry policy.
///
/// Every `EngineError` classifies into exactly one kind; classification
/// happens once per step failure, in the error classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad module identifier, invalid path syntax. Never retried.
    Configuration,
    /// Input/output shape mismatch. Fatal unless a fallback step exists.
    Validation,
    /// Timeout, throttling, temporary unavailability. May succeed on retry.
    Transient,
    /// Mechanically successful but semantically invalid output.
    /// Retryable under a separate, smaller budget.
    Content,
    /// Clean terminal state, not an error.
    Cancellation,
}

/// Core error type for the Conflux engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error
    #[error("Transient error: {0}")]
    Transient(String),

    /// Content error
    #[error("Content error: {0}")]
    Content(String),

    /// Execution was cancelled
    #[error("Execution cancelled")]
    Cancelled,

    /// Step not found in the flow definition
    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// No handler registered for a module identifier
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// Expression compilation or evaluation error
    #[error("Expression error: {0}")]
    Expression(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Object store error
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// Module handler error without a more specific classification
    #[error("Module error: {0}")]
    Module(String),

    /// Flow execution error
    #[error("Flow execution error: {0}")]
    FlowExecution(String),
}

impl EngineError {
    /// Classify this error into its failure family
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Configuration(_)
            | EngineError::StepNotFound(_)
            | EngineError::ModuleNotFound(_)
            | EngineError::Expression(_) => ErrorKind::Configuration,
            EngineError::Validation(_)
            | EngineError::Serialization(_)
            | EngineError::FlowExecution(_) => ErrorKind::Validation,
            // The object store may be eventually consistent, so a failed
            // dereference is worth retrying. Unclassified module errors are
            // treated the same way, favoring availability.
            EngineError::Transient(_) | EngineError::ObjectStore(_) | EngineError::Module(_) => {
                ErrorKind::Transient
            }
            EngineError::Content(_) => ErrorKind::Content,
            EngineError::Cancelled => ErrorKind::Cancellation,
        }
    }

    /// Variant name, matched against the retry policy's allow-list
    pub fn name(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "Configuration",
            EngineError::Validation(_) => "Validation",
            EngineError::Transient(_) => "Transient",
            EngineError::Content(_) => "Content",
            EngineError::Cancelled => "Cancelled",
            EngineError::StepNotFound(_) => "StepNotFound",
            EngineError::ModuleNotFound(_) => "ModuleNotFound",
            EngineError::Expression(_) => "Expression",
            EngineError::Serialization(_) => "Serialization",
            EngineError::ObjectStore(_) => "ObjectStore",
            EngineError::Module(_) => "Module",
            EngineError::FlowExecution(_) => "FlowExecution",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<conflux_object_store::ObjectStoreError> for EngineError {
    fn from(err: conflux_object_store::ObjectStoreError) -> Self {
        EngineError::ObjectStore(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Module(format!("{:#}", err))
    }
}
