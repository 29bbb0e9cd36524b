//! Engine layer: the components that execute a flow definition against a
//! runtime state

/// Fork and aggregate coordination
pub mod fork;

/// Input/output data mapping
pub mod mapping;

/// Large-payload offloading and hydration
pub mod offload;

/// Step orchestration and in-process drivers
pub mod orchestrator;

/// Polling-loop state machine
pub mod polling;

/// Module handler registry
pub mod registry;

/// Failure classification and recovery decisions
pub mod retry;
