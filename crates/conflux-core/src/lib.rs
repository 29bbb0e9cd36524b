//!
//! Conflux Core - declarative flow execution engine
//!
//! This crate executes declarative, step-based flow definitions: it maps
//! data between a running context and step inputs, dispatches steps to
//! pluggable module handlers, recovers from failures with configurable
//! retry/fallback policies, fans out parallel fork branches and merges them
//! back, and suspends polling loops against durable timers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - flow definitions, path expressions, runtime state
pub mod domain;

/// Engine layer - mapping, dispatch, recovery, fork/aggregate, polling
pub mod engine;

/// Error types
pub mod error;

/// Execution trace records and sinks
pub mod types;

// Re-export key types
pub use error::{EngineError, ErrorKind};
pub use types::{BufferingTraceSink, TraceEvent, TracePhase, TraceSink, TraceStatus, TracingTraceSink};

// Re-export main API types for easy use
pub use domain::flow_definition::{
    AggregateConfig, AggregationStrategy, ErrorPolicy, FlowDefinition, FlowId, ForkConfig,
    InputMapping, ModuleId, OutputMapping, PollingConfig, StepId, StepInstance, StepKind,
    Transition,
};
pub use domain::path::PathExpr;
pub use domain::runtime_state::{
    BranchId, BranchStatus, BranchTable, CorrelationId, ExecutionId, FlowStatus, RunningContext,
    RuntimeState, TerminalError,
};
pub use engine::fork::ForkCoordinator;
pub use engine::mapping::MappingEngine;
pub use engine::offload::{PayloadOffloader, PayloadPointer};
pub use engine::orchestrator::{
    DurableScheduler, InMemoryScheduler, OrchestratorConfig, StepOrchestrator, StepOutcome,
};
pub use engine::polling::{ExternalCall, PollTurn, PollingLoop};
pub use engine::registry::{ModuleHandler, ModuleRegistry, StepContext};
pub use engine::retry::{ErrorClassifier, RetryBounds, RetryDecision};
