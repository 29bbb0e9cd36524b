//! Polling-loop state machine
//!
//! A poll step repeatedly invokes an external call until a success or
//! failure condition holds on the response, or the attempt budget runs out.
//! The loop itself is a serializable value carried inside the runtime state:
//! between invocations the execution suspends and the durable scheduler
//! resumes it, so a loop survives process restarts mid-wait.

use crate::domain::flow_definition::PollingConfig;
use crate::domain::path::PathExpr;
use crate::error::{EngineError, ErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Immediate re-invocations allowed when a single poll invocation fails
/// transiently, before the failure surfaces to the step's error policy
const INVOCATION_RETRY_BUDGET: u32 = 2;

/// Capability for invoking an external endpoint from a poll step.
///
/// The descriptor is the step's opaque `call` configuration; the engine
/// never interprets it.
#[async_trait]
pub trait ExternalCall: Send + Sync {
    /// Perform one invocation and return the raw response
    async fn call(&self, descriptor: &Value) -> Result<Value, EngineError>;
}

/// Where the loop is between invocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    /// Ready to perform the next invocation
    Invoke,
    /// Suspended between invocations
    Wait,
    /// Terminal success
    Succeeded,
    /// Terminal failure
    Failed,
}

/// Outcome of one turn of the polling loop
#[derive(Debug, Clone, PartialEq)]
pub enum PollTurn {
    /// Suspend and resume after the interval
    Suspend(Duration),
    /// The success condition held; carries the final response
    Succeeded(Value),
    /// The failure condition held or the budget ran out
    Failed(String),
}

/// Serializable polling-loop state, suspended and resumed across turns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingLoop {
    config: PollingConfig,
    attempts_made: u32,
    phase: PollPhase,
}

impl PollingLoop {
    /// Create a loop positioned before its first invocation
    pub fn new(config: PollingConfig) -> Self {
        Self {
            config,
            attempts_made: 0,
            phase: PollPhase::Invoke,
        }
    }

    /// Invocations performed so far
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// Current phase
    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    /// Perform one turn: a single external invocation followed by condition
    /// evaluation.
    ///
    /// A loop with `max_attempts` N performs exactly N invocations before it
    /// fails with exhaustion; the exhaustion check runs after the invocation
    /// so the final response still gets a chance to satisfy a condition.
    pub async fn advance(&mut self, call: &dyn ExternalCall) -> Result<PollTurn, EngineError> {
        match self.phase {
            PollPhase::Succeeded | PollPhase::Failed => {
                return Err(EngineError::FlowExecution(
                    "Polling loop is already terminal".to_string(),
                ))
            }
            PollPhase::Wait => self.phase = PollPhase::Invoke,
            PollPhase::Invoke => {}
        }

        self.attempts_made += 1;
        let response = self.invoke_with_retry(call).await?;

        if self.condition_holds(&self.config.success_condition, &response)? {
            self.phase = PollPhase::Succeeded;
            tracing::debug!(
                attempts = self.attempts_made,
                "Polling loop succeeded"
            );
            return Ok(PollTurn::Succeeded(response));
        }

        if self.condition_holds(&self.config.failure_condition, &response)? {
            self.phase = PollPhase::Failed;
            return Ok(PollTurn::Failed(format!(
                "Polling failure condition held after {} attempts",
                self.attempts_made
            )));
        }

        if self.attempts_made >= self.config.max_attempts {
            self.phase = PollPhase::Failed;
            return Ok(PollTurn::Failed(format!(
                "Polling exhausted after {} attempts",
                self.attempts_made
            )));
        }

        self.phase = PollPhase::Wait;
        Ok(PollTurn::Suspend(Duration::from_secs(
            self.config.interval_secs,
        )))
    }

    /// One invocation with a small immediate-retry budget for transient
    /// faults. Persistent failures propagate to the step's error policy.
    async fn invoke_with_retry(&self, call: &dyn ExternalCall) -> Result<Value, EngineError> {
        let mut last_error = None;
        for _ in 0..=INVOCATION_RETRY_BUDGET {
            match call.call(&self.config.call).await {
                Ok(response) => return Ok(response),
                Err(err) if err.kind() == ErrorKind::Transient => {
                    tracing::debug!(error = %err, "Transient poll invocation failure, retrying");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            EngineError::Transient("Poll invocation failed".to_string())
        }))
    }

    fn condition_holds(&self, expr: &str, response: &Value) -> Result<bool, EngineError> {
        let path = PathExpr::parse(expr)?;
        Ok(path.resolve(response).is_some_and(|v| is_truthy(&v)))
    }
}

/// JSON truthiness: null, false, zero, empty string, empty array, and empty
/// object are falsy; everything else is truthy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
