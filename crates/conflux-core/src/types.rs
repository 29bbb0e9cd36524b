//! Execution trace records
//!
//! Every mapping resolution, dispatch, retry decision, and transition emits a
//! trace event. The engine does not retain events; it hands them to a
//! `TraceSink`, which is fire-and-forget by contract: appending must never
//! block or fail the flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;

/// Execution phase a trace event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracePhase {
    /// Building step input from the running context
    InputMapping,
    /// Merging step output back into the running context
    OutputMapping,
    /// Handler dispatch
    Dispatch,
    /// Retry/fallback/continue decision
    Recovery,
    /// Branch split
    Fork,
    /// Branch merge
    Aggregate,
    /// Polling loop iteration
    Polling,
    /// Transition selection
    Transition,
}

/// Outcome of the traced operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    /// The operation succeeded
    Ok,
    /// The operation was skipped (e.g. optional mapping with no source)
    Skipped,
    /// The operation failed
    Error,
}

/// One record in the execution trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Phase the event belongs to
    pub phase: TracePhase,

    /// Outcome of the operation
    pub status: TraceStatus,

    /// Human-readable summary
    pub message: String,

    /// Structured details (paths, step ids, decisions)
    pub details: Value,

    /// Timestamp when the event was recorded
    pub timestamp: DateTime<Utc>,
}

impl TraceEvent {
    /// Create a trace event timestamped now
    pub fn new(
        phase: TracePhase,
        status: TraceStatus,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            phase,
            status,
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

/// Sink for execution trace events.
///
/// Implementations must not block and must not propagate failures; a sink
/// that drops events on overload is acceptable, one that stalls a flow is
/// not.
pub trait TraceSink: Send + Sync {
    /// Append an event to the trace
    fn append(&self, event: TraceEvent);
}

/// Sink that forwards events to the process-local `tracing` subscriber
#[derive(Debug, Default)]
pub struct TracingTraceSink;

impl TraceSink for TracingTraceSink {
    fn append(&self, event: TraceEvent) {
        match event.status {
            TraceStatus::Error => tracing::warn!(
                phase = ?event.phase,
                details = %event.details,
                "{}",
                event.message
            ),
            _ => tracing::debug!(
                phase = ?event.phase,
                status = ?event.status,
                details = %event.details,
                "{}",
                event.message
            ),
        }
    }
}

/// Sink that buffers events in memory, used by tests and diagnostics
#[derive(Debug, Default)]
pub struct BufferingTraceSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl BufferingTraceSink {
    /// Create an empty buffering sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return all buffered events
    pub fn take(&self) -> Vec<TraceEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(_) => Vec::new(),
        }
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceSink for BufferingTraceSink {
    fn append(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
