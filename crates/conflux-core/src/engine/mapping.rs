//! Input/output data mapping
//!
//! Builds a step's input object from the running context and merges a step's
//! output back in. Input is built against the *hydrated* context so handlers
//! never see payload pointers; output values above the size threshold are
//! offloaded before they are embedded. Every resolution emits a trace event.

use crate::domain::flow_definition::StepInstance;
use crate::domain::path::PathExpr;
use crate::domain::runtime_state::RunningContext;
use crate::engine::offload::PayloadOffloader;
use crate::error::EngineError;
use crate::types::{TraceEvent, TracePhase, TraceSink, TraceStatus};
use serde_json::{json, Value};
use std::sync::Arc;

/// Builds step input and applies step output via the step's mapping rules
pub struct MappingEngine {
    offloader: Arc<PayloadOffloader>,
    trace: Arc<dyn TraceSink>,
}

impl MappingEngine {
    /// Create a mapping engine
    pub fn new(offloader: Arc<PayloadOffloader>, trace: Arc<dyn TraceSink>) -> Self {
        Self { offloader, trace }
    }

    /// Build the step's input object.
    ///
    /// Static `config` values merge first so dynamic mappings can override
    /// them. Missing optional sources are skipped; a missing required source
    /// is a fatal schema-validation failure. The result contains exactly the
    /// declared mapped keys plus passthrough config; unmapped context fields
    /// never leak in.
    pub async fn build_step_input(
        &self,
        step: &StepInstance,
        context: &RunningContext,
    ) -> Result<Value, EngineError> {
        let hydrated = self.offloader.hydrate(context.as_value().clone()).await?;

        let mut input = step.config.clone();
        if !input.is_object() {
            input = Value::Object(serde_json::Map::new());
        }

        for rule in &step.input_mappings {
            let source = PathExpr::parse(&rule.source)?;
            let target = PathExpr::parse(&rule.target)?;

            match source.resolve(&hydrated) {
                Some(value) => {
                    target.assign(&mut input, value)?;
                    self.trace.append(TraceEvent::new(
                        TracePhase::InputMapping,
                        TraceStatus::Ok,
                        "Resolved input mapping",
                        json!({
                            "step": step.id.0,
                            "source": rule.source,
                            "target": rule.target,
                        }),
                    ));
                }
                None if rule.required => {
                    self.trace.append(TraceEvent::new(
                        TracePhase::InputMapping,
                        TraceStatus::Error,
                        "Required input mapping has no source value",
                        json!({
                            "step": step.id.0,
                            "source": rule.source,
                            "target": rule.target,
                        }),
                    ));
                    return Err(EngineError::Validation(format!(
                        "Step {} requires input from missing context path: {}",
                        step.id, rule.source
                    )));
                }
                None => {
                    self.trace.append(TraceEvent::new(
                        TracePhase::InputMapping,
                        TraceStatus::Skipped,
                        "Optional input mapping skipped",
                        json!({
                            "step": step.id.0,
                            "source": rule.source,
                            "target": rule.target,
                        }),
                    ));
                }
            }
        }

        Ok(input)
    }

    /// Merge the step's output into a copy of the running context.
    ///
    /// The input context is never mutated; callers receive a new context, so
    /// concurrent branches never alias state. Missing output sources are
    /// absorbed as skips.
    pub async fn apply_step_output(
        &self,
        step: &StepInstance,
        context: &RunningContext,
        output: &Value,
    ) -> Result<RunningContext, EngineError> {
        let mut next = context.clone();

        for rule in &step.output_mappings {
            let source = PathExpr::parse(&rule.source)?;
            let target = PathExpr::parse(&rule.target)?;

            match source.resolve(output) {
                Some(value) => {
                    let value = self.offloader.maybe_offload(value).await?;
                    next = next.with_merged(&target, value)?;
                    self.trace.append(TraceEvent::new(
                        TracePhase::OutputMapping,
                        TraceStatus::Ok,
                        "Merged output mapping",
                        json!({
                            "step": step.id.0,
                            "source": rule.source,
                            "target": rule.target,
                        }),
                    ));
                }
                None => {
                    self.trace.append(TraceEvent::new(
                        TracePhase::OutputMapping,
                        TraceStatus::Skipped,
                        "Output mapping had no source value",
                        json!({
                            "step": step.id.0,
                            "source": rule.source,
                            "target": rule.target,
                        }),
                    ));
                }
            }
        }

        Ok(next)
    }
}
