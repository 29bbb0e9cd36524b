//! Domain layer: immutable flow definitions, path expressions, and
//! per-execution runtime state

/// Flow and step definitions
pub mod flow_definition;

/// Dot/bracket path expressions over JSON documents
pub mod path;

/// Per-execution runtime state
pub mod runtime_state;
