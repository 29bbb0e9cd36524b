//! Per-execution runtime state
//!
//! `RuntimeState` is the mutable record the orchestrator threads through a
//! single flow execution: current position in the graph, the accumulating
//! running context, attempt counters, the branch-tracking table for in-flight
//! forks, and any suspended polling loop. One execution owns its state
//! exclusively; branches get structural copies, never shared references.

use crate::domain::flow_definition::{FlowId, StepId};
use crate::domain::path::PathExpr;
use crate::engine::polling::PollingLoop;
use crate::error::{EngineError, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use uuid::Uuid;

/// Value object: Execution ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

/// Value object: Correlation ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

/// Value object: Branch ID, identifies one fork branch independent of its
/// position in the launch order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId(pub String);

impl Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    /// Execution is advancing through steps
    Running,

    /// Execution yielded and waits for the durable scheduler to resume it
    WaitingForTimer,

    /// Execution completed successfully
    Completed,

    /// Execution failed terminally
    Failed,

    /// Execution was cancelled at a step boundary
    Cancelled,
}

impl FlowStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }
}

/// The last classified error of a failed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalError {
    /// Failure family of the final error
    pub kind: ErrorKind,

    /// Human-readable message
    pub message: String,

    /// Step at which the failure occurred
    pub step: StepId,
}

/// The mutable JSON document threaded through one flow execution.
///
/// Grows monotonically as steps merge outputs in. Mutation always goes
/// through copy-returning operations so concurrent branches never alias
/// context state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningContext {
    value: Value,
}

impl Default for RunningContext {
    fn default() -> Self {
        Self {
            value: Value::Object(serde_json::Map::new()),
        }
    }
}

impl RunningContext {
    /// Create a context from an initial JSON document
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// Borrow the inner JSON document
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// Take ownership of the inner JSON document
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Resolve a path expression against the context
    pub fn resolve(&self, expr: &PathExpr) -> Option<Value> {
        expr.resolve(&self.value)
    }

    /// Return a new context with `value` deep-merged at `expr`.
    ///
    /// The receiver is never mutated.
    pub fn with_merged(&self, expr: &PathExpr, value: Value) -> Result<Self, EngineError> {
        let mut next = self.value.clone();
        expr.merge_at(&mut next, value)?;
        Ok(Self { value: next })
    }
}

/// Terminal state of one fork branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchStatus {
    /// Branch is still executing
    Running,

    /// Branch reached a successful terminal state
    Succeeded,

    /// Branch failed without recovery
    Failed,

    /// Branch was explicitly skipped (e.g. cancelled)
    Skipped,
}

/// Tracking record for one launched branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    /// Branch identity; never positional
    pub id: BranchId,

    /// Position in the launch order, used by order-preserving aggregation
    pub launch_index: usize,

    /// Current terminal/non-terminal status
    pub status: BranchStatus,

    /// Final output for succeeded branches
    pub output: Option<Value>,

    /// Failure message for failed branches
    pub error: Option<String>,

    /// Monotonic completion sequence, used by last-completed-wins merging
    pub completion_seq: Option<u64>,
}

/// Branch-tracking table for an in-flight fork
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchTable {
    branches: HashMap<String, BranchRecord>,
    next_completion_seq: u64,
}

impl BranchTable {
    /// Register a launched branch
    pub fn register(&mut self, id: BranchId, launch_index: usize) {
        self.branches.insert(
            id.0.clone(),
            BranchRecord {
                id,
                launch_index,
                status: BranchStatus::Running,
                output: None,
                error: None,
                completion_seq: None,
            },
        );
    }

    /// Record a branch's successful terminal output
    pub fn record_success(&mut self, id: &BranchId, output: Value) -> Result<(), EngineError> {
        let seq = self.bump_seq();
        let record = self.record_mut(id)?;
        record.status = BranchStatus::Succeeded;
        record.output = Some(output);
        record.completion_seq = Some(seq);
        Ok(())
    }

    /// Record a branch's unrecoverable failure
    pub fn record_failure(&mut self, id: &BranchId, error: String) -> Result<(), EngineError> {
        let seq = self.bump_seq();
        let record = self.record_mut(id)?;
        record.status = BranchStatus::Failed;
        record.error = Some(error);
        record.completion_seq = Some(seq);
        Ok(())
    }

    /// Record an explicitly skipped branch
    pub fn record_skip(&mut self, id: &BranchId) -> Result<(), EngineError> {
        let seq = self.bump_seq();
        let record = self.record_mut(id)?;
        record.status = BranchStatus::Skipped;
        record.completion_seq = Some(seq);
        Ok(())
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_completion_seq;
        self.next_completion_seq += 1;
        seq
    }

    fn record_mut(&mut self, id: &BranchId) -> Result<&mut BranchRecord, EngineError> {
        self.branches.get_mut(&id.0).ok_or_else(|| {
            EngineError::FlowExecution(format!("Unknown branch: {}", id))
        })
    }

    /// Whether every launched branch has reported a terminal outcome
    pub fn all_terminal(&self) -> bool {
        self.branches
            .values()
            .all(|record| record.status != BranchStatus::Running)
    }

    /// Whether any branch failed unrecoverably
    pub fn any_failed(&self) -> bool {
        self.branches
            .values()
            .any(|record| record.status == BranchStatus::Failed)
    }

    /// First failure message among failed branches, if any
    pub fn first_failure(&self) -> Option<&str> {
        let mut failed: Vec<&BranchRecord> = self
            .branches
            .values()
            .filter(|record| record.status == BranchStatus::Failed)
            .collect();
        failed.sort_by_key(|record| record.completion_seq);
        failed.first().and_then(|record| record.error.as_deref())
    }

    /// Iterate over all branch records
    pub fn records(&self) -> impl Iterator<Item = &BranchRecord> {
        self.branches.values()
    }

    /// Number of launched branches
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Whether no branches have been launched
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Drop all branch records, done after aggregation completes
    pub fn clear(&mut self) {
        self.branches.clear();
    }
}

/// Per-execution mutable record, created at flow start and archived at
/// terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    /// Unique execution identifier
    pub execution_id: ExecutionId,

    /// Correlation identifier for external event matching and logging
    pub correlation_id: CorrelationId,

    /// Flow definition being executed
    pub flow_id: FlowId,

    /// Step the orchestrator will execute next
    pub current_step: StepId,

    /// Current status
    pub status: FlowStatus,

    /// The accumulating running context
    pub context: RunningContext,

    /// Attempts made at the current step
    pub attempts: u32,

    /// Content-error attempts made at the current step
    pub content_attempts: u32,

    /// Branch-tracking table for an in-flight fork
    pub branches: BranchTable,

    /// Suspended polling loop, present while a poll step is in flight
    pub polling: Option<PollingLoop>,

    /// Emit verbose per-step trace details
    pub verbose_logging: bool,

    /// Cancellation was requested; honored at the next step boundary
    pub cancel_requested: bool,

    /// Terminal error for failed executions
    pub error: Option<TerminalError>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl RuntimeState {
    /// Create runtime state positioned at a flow's start step
    pub fn new(flow_id: FlowId, start_step: StepId, initial_context: Value) -> Self {
        let execution_id = ExecutionId(Uuid::new_v4().to_string());
        let correlation_id = CorrelationId(format!("exec-{}", execution_id.0));
        let now = Utc::now();

        Self {
            execution_id,
            correlation_id,
            flow_id,
            current_step: start_step,
            status: FlowStatus::Running,
            context: RunningContext::new(initial_context),
            attempts: 0,
            content_attempts: 0,
            branches: BranchTable::default(),
            polling: None,
            verbose_logging: false,
            cancel_requested: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the last-modified timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Reset per-step attempt counters, done on advance and on fallback
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
        self.content_attempts = 0;
    }

    /// Request cancellation; takes effect at the next step boundary
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.touch();
    }

    /// Mark the execution completed
    pub fn complete(&mut self) -> Result<(), EngineError> {
        self.require_active("complete")?;
        self.status = FlowStatus::Completed;
        self.touch();
        Ok(())
    }

    /// Mark the execution failed with its final classified error
    pub fn fail(&mut self, error: TerminalError) -> Result<(), EngineError> {
        self.require_active("fail")?;
        self.status = FlowStatus::Failed;
        self.error = Some(error);
        self.touch();
        Ok(())
    }

    /// Mark the execution cancelled. The context keeps the last fully
    /// applied output mapping; nothing is rolled back.
    pub fn cancel(&mut self) -> Result<(), EngineError> {
        self.require_active("cancel")?;
        self.status = FlowStatus::Cancelled;
        self.touch();
        Ok(())
    }

    /// Suspend, waiting for the durable scheduler to resume the execution
    pub fn suspend_for_timer(&mut self) -> Result<(), EngineError> {
        if self.status != FlowStatus::Running {
            return Err(EngineError::FlowExecution(format!(
                "Cannot suspend execution in state: {:?}",
                self.status
            )));
        }
        self.status = FlowStatus::WaitingForTimer;
        self.touch();
        Ok(())
    }

    /// Resume a suspended execution
    pub fn resume(&mut self) -> Result<(), EngineError> {
        if self.status != FlowStatus::WaitingForTimer {
            return Err(EngineError::FlowExecution(format!(
                "Cannot resume execution in state: {:?}",
                self.status
            )));
        }
        self.status = FlowStatus::Running;
        self.touch();
        Ok(())
    }

    /// Create an independently-owned branch state: a structural copy of the
    /// parent context positioned at the branch entry step, with its own
    /// execution identity and a clean branch table.
    pub fn branch_copy(&self, branch_start: StepId) -> Self {
        let execution_id = ExecutionId(Uuid::new_v4().to_string());
        let now = Utc::now();

        Self {
            execution_id,
            correlation_id: self.correlation_id.clone(),
            flow_id: self.flow_id.clone(),
            current_step: branch_start,
            status: FlowStatus::Running,
            context: self.context.clone(),
            attempts: 0,
            content_attempts: 0,
            branches: BranchTable::default(),
            polling: None,
            verbose_logging: self.verbose_logging,
            cancel_requested: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn require_active(&self, action: &str) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::FlowExecution(format!(
                "Cannot {} execution in terminal state: {:?}",
                action, self.status
            )));
        }
        Ok(())
    }
}
