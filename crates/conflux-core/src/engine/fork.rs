//! Fork and aggregate coordination
//!
//! A fork step splits the running context into one independently-owned branch
//! context per element of a source array. Branches are tracked by identity in
//! the parent's branch table; the matching aggregate step merges their
//! terminal outputs back with a declared strategy. Branch outputs are whole
//! terminal branch contexts, so aggregation strategies see everything a
//! branch accumulated.

use crate::domain::flow_definition::{AggregateConfig, AggregationStrategy, ForkConfig};
use crate::domain::path::{deep_merge, PathExpr};
use crate::domain::runtime_state::{BranchId, BranchRecord, BranchStatus, RuntimeState};
use crate::engine::offload::PayloadOffloader;
use crate::engine::registry::{ModuleRegistry, StepContext};
use crate::error::EngineError;
use crate::types::{TraceEvent, TracePhase, TraceSink, TraceStatus};
use serde_json::{json, Value};
use std::sync::Arc;

/// Splits executions into branches and merges branch outputs back
pub struct ForkCoordinator {
    offloader: Arc<PayloadOffloader>,
    registry: Arc<ModuleRegistry>,
    trace: Arc<dyn TraceSink>,
}

impl ForkCoordinator {
    /// Create a coordinator
    pub fn new(
        offloader: Arc<PayloadOffloader>,
        registry: Arc<ModuleRegistry>,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            offloader,
            registry,
            trace,
        }
    }

    /// Split the parent execution into one branch per source-array element.
    ///
    /// Each branch gets a structural copy of the parent context with the
    /// element injected at the configured path, its own execution identity,
    /// and an entry in the parent's branch table recording launch order.
    /// An empty source array is legal and produces zero branches; the
    /// matching aggregate then merges nothing.
    pub async fn fork(
        &self,
        config: &ForkConfig,
        parent: &mut RuntimeState,
    ) -> Result<Vec<RuntimeState>, EngineError> {
        let source = PathExpr::parse(&config.source)?;
        let item_target = PathExpr::parse(&config.item_target)?;

        let resolved = parent.context.resolve(&source).ok_or_else(|| {
            EngineError::Validation(format!("Fork source path has no value: {}", config.source))
        })?;
        let resolved = self.offloader.hydrate(resolved).await?;

        let items = match resolved {
            Value::Array(items) => items,
            other => {
                return Err(EngineError::Validation(format!(
                    "Fork source must be an array, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let mut branches = Vec::with_capacity(items.len());
        for (launch_index, item) in items.into_iter().enumerate() {
            let mut branch = parent.branch_copy(config.branch_start.clone());
            branch.context = branch.context.with_merged(&item_target, item)?;

            parent
                .branches
                .register(BranchId(branch.execution_id.0.clone()), launch_index);
            branches.push(branch);
        }

        self.trace.append(TraceEvent::new(
            TracePhase::Fork,
            TraceStatus::Ok,
            "Launched fork branches",
            json!({
                "source": config.source,
                "branch_start": config.branch_start.0,
                "branch_count": branches.len(),
            }),
        ));

        Ok(branches)
    }

    /// Merge the terminal branch outputs recorded in the parent's branch
    /// table.
    ///
    /// Reaching the aggregate step while a branch is still running is a
    /// transient condition: the substrate re-dispatches once the stragglers
    /// report. A failed branch fails the aggregate, which then goes through
    /// the aggregate step's own error policy. The branch table is cleared
    /// once the merge succeeds.
    pub async fn aggregate(
        &self,
        config: &AggregateConfig,
        parent: &mut RuntimeState,
    ) -> Result<Value, EngineError> {
        if !parent.branches.all_terminal() {
            return Err(EngineError::Transient(
                "Aggregate reached before all branches are terminal".to_string(),
            ));
        }

        if parent.branches.any_failed() {
            let message = parent
                .branches
                .first_failure()
                .unwrap_or("unknown branch failure")
                .to_string();
            self.trace.append(TraceEvent::new(
                TracePhase::Aggregate,
                TraceStatus::Error,
                "Branch failure reached aggregation",
                json!({"first_failure": message}),
            ));
            return Err(EngineError::FlowExecution(format!(
                "Branch failed before aggregation: {}",
                message
            )));
        }

        let merged = self.merge(&config.strategy, parent).await?;
        let branch_count = parent.branches.len();
        parent.branches.clear();

        self.trace.append(TraceEvent::new(
            TracePhase::Aggregate,
            TraceStatus::Ok,
            "Merged branch outputs",
            json!({
                "strategy": serde_json::to_value(&config.strategy)?,
                "branch_count": branch_count,
            }),
        ));

        Ok(merged)
    }

    async fn merge(
        &self,
        strategy: &AggregationStrategy,
        parent: &RuntimeState,
    ) -> Result<Value, EngineError> {
        match strategy {
            AggregationStrategy::CollectArray => {
                // Launch order, regardless of completion order
                let outputs = succeeded_by_launch(parent)
                    .into_iter()
                    .filter_map(|record| record.output.clone())
                    .collect();
                Ok(Value::Array(outputs))
            }
            AggregationStrategy::MergeObjects => {
                // Completion order; conflicting keys resolve
                // last-completed-wins
                let mut succeeded: Vec<&BranchRecord> = parent
                    .branches
                    .records()
                    .filter(|record| record.status == BranchStatus::Succeeded)
                    .collect();
                succeeded.sort_by_key(|record| record.completion_seq);

                let mut merged = Value::Object(serde_json::Map::new());
                for record in succeeded {
                    if let Some(output) = &record.output {
                        deep_merge(&mut merged, output.clone());
                    }
                }
                Ok(merged)
            }
            AggregationStrategy::Sum { field } => {
                let expr = PathExpr::parse(field)?;
                let mut total = 0.0;
                for record in succeeded_by_launch(parent) {
                    let output = record.output.as_ref().ok_or_else(|| {
                        EngineError::FlowExecution(format!(
                            "Succeeded branch {} has no output",
                            record.id
                        ))
                    })?;
                    let value = expr.resolve(output).and_then(|v| v.as_f64());
                    match value {
                        Some(n) => total += n,
                        None => {
                            return Err(EngineError::Validation(format!(
                                "Branch {} output has no numeric field at {}",
                                record.id, field
                            )))
                        }
                    }
                }
                Ok(json!(total))
            }
            AggregationStrategy::CustomModule { module } => {
                let handler = self.registry.get(module)?;
                let outputs: Vec<Value> = succeeded_by_launch(parent)
                    .into_iter()
                    .filter_map(|record| record.output.clone())
                    .collect();
                let ctx = StepContext {
                    execution_id: parent.execution_id.clone(),
                    correlation_id: parent.correlation_id.clone(),
                    step: parent.current_step.clone(),
                    attempt: parent.attempts.max(1),
                };
                handler.invoke(json!({ "branchOutputs": outputs }), &ctx).await
            }
        }
    }
}

fn succeeded_by_launch(parent: &RuntimeState) -> Vec<&BranchRecord> {
    let mut succeeded: Vec<&BranchRecord> = parent
        .branches
        .records()
        .filter(|record| record.status == BranchStatus::Succeeded)
        .collect();
    succeeded.sort_by_key(|record| record.launch_index);
    succeeded
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
