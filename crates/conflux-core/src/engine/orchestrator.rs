//! Step orchestration
//!
//! The orchestrator owns the step lifecycle: build input, dispatch, apply
//! output, select the next transition. It advances one step per call so an
//! external substrate can persist the runtime state between steps; the
//! `run_to_terminal` driver loops in-process for embedded use and tests.

use crate::domain::flow_definition::{FlowDefinition, StepId, StepInstance, StepKind};
use crate::domain::runtime_state::{
    BranchId, ExecutionId, FlowStatus, RunningContext, RuntimeState, TerminalError,
};
use crate::engine::fork::ForkCoordinator;
use crate::engine::mapping::MappingEngine;
use crate::engine::offload::PayloadOffloader;
use crate::engine::polling::{ExternalCall, PollTurn, PollingLoop};
use crate::engine::registry::{ModuleRegistry, StepContext};
use crate::engine::retry::{ErrorClassifier, RetryBounds, RetryDecision};
use crate::error::{EngineError, ErrorKind};
use crate::types::{TraceEvent, TracePhase, TraceSink, TraceStatus};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// Capability for durable timers.
///
/// The engine never sleeps in-process on its own: suspensions go through
/// this trait so a production substrate can persist the timer and survive
/// restarts.
#[async_trait]
pub trait DurableScheduler: Send + Sync {
    /// Schedule the execution to resume after the delay. Resolves when the
    /// timer fires for in-process schedulers; durable implementations may
    /// resolve immediately after persisting the timer.
    async fn schedule_resume(
        &self,
        execution: &ExecutionId,
        resume_after: Duration,
    ) -> Result<(), EngineError>;
}

/// In-process scheduler backed by tokio timers; records every scheduled
/// resume for inspection
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    scheduled: Mutex<Vec<(ExecutionId, Duration)>>,
}

impl InMemoryScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// All resumes scheduled so far, in order
    pub fn scheduled(&self) -> Vec<(ExecutionId, Duration)> {
        self.scheduled
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DurableScheduler for InMemoryScheduler {
    async fn schedule_resume(
        &self,
        execution: &ExecutionId,
        resume_after: Duration,
    ) -> Result<(), EngineError> {
        if let Ok(mut scheduled) = self.scheduled.lock() {
            scheduled.push((execution.clone(), resume_after));
        }
        tokio::time::sleep(resume_after).await;
        Ok(())
    }
}

/// Discriminated result of executing one step: what happened, and what the
/// caller must do next
#[derive(Debug)]
pub enum StepOutcome {
    /// Output applied and position advanced. `None` means the flow completed.
    Advance {
        /// Step the execution advanced to
        next: Option<StepId>,
    },

    /// A retry was granted; the same step re-dispatches after the delay
    Retry {
        /// Backoff delay before the next attempt
        delay: Duration,
    },

    /// Recovery diverted execution to the policy's fallback step
    Fallback {
        /// Step the execution diverted to
        step: StepId,
    },

    /// The step failed, its policy continued with an empty default output,
    /// and the normal transition path applied
    ContinueWithDefault {
        /// Step the execution advanced to
        next: Option<StepId>,
    },

    /// The execution failed terminally
    Fail {
        /// Final classified error
        error: TerminalError,
    },

    /// A fork launched these branch states; the caller must drive them to
    /// terminal and their outcomes land in the parent's branch table
    ForkBranches {
        /// Independently-owned branch states
        branches: Vec<RuntimeState>,
        /// Branch concurrency ceiling from the fork configuration
        max_concurrency: Option<usize>,
    },

    /// Branch outputs merged and position advanced past the aggregate step
    AggregateComplete {
        /// Step the execution advanced to
        next: Option<StepId>,
    },

    /// The execution suspended waiting for a timer (polling interval)
    Suspended {
        /// Delay before the execution should resume
        resume_after: Duration,
    },

    /// Cancellation was honored at the step boundary
    Cancelled,
}

/// Tuning knobs applied across all flows.
///
/// There is deliberately no `Default`: unbounded fan-out is never an
/// acceptable fallback, so every embedder states its branch ceiling.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Platform-wide retry caps
    pub retry_bounds: RetryBounds,

    /// Branch concurrency ceiling applied when a fork does not set its own
    pub branch_concurrency: usize,
}

impl OrchestratorConfig {
    /// Build a config with the given branch concurrency ceiling and default
    /// retry bounds
    pub fn new(branch_concurrency: usize) -> Self {
        Self {
            retry_bounds: RetryBounds::default(),
            branch_concurrency,
        }
    }
}

/// Drives flow executions one step at a time
pub struct StepOrchestrator {
    mapping: MappingEngine,
    registry: Arc<ModuleRegistry>,
    forker: ForkCoordinator,
    classifier: ErrorClassifier,
    scheduler: Arc<dyn DurableScheduler>,
    external: Arc<dyn ExternalCall>,
    trace: Arc<dyn TraceSink>,
    config: OrchestratorConfig,
}

impl StepOrchestrator {
    /// Assemble an orchestrator from its capabilities
    pub fn new(
        offloader: Arc<PayloadOffloader>,
        registry: Arc<ModuleRegistry>,
        external: Arc<dyn ExternalCall>,
        scheduler: Arc<dyn DurableScheduler>,
        trace: Arc<dyn TraceSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            mapping: MappingEngine::new(offloader.clone(), trace.clone()),
            forker: ForkCoordinator::new(offloader, registry.clone(), trace.clone()),
            registry,
            classifier: ErrorClassifier::new(config.retry_bounds.clone()),
            scheduler,
            external,
            trace,
            config,
        }
    }

    /// Execute the step the state is positioned at.
    ///
    /// Exactly one step per call. Cancellation is honored here, at the step
    /// boundary, before any dispatch.
    pub async fn advance(
        &self,
        flow: &FlowDefinition,
        state: &mut RuntimeState,
    ) -> Result<StepOutcome, EngineError> {
        if state.cancel_requested {
            state.polling = None;
            state.cancel()?;
            tracing::info!(
                execution_id = %state.execution_id,
                step = %state.current_step,
                "Cancellation honored at step boundary"
            );
            return Ok(StepOutcome::Cancelled);
        }

        let step = flow.step(&state.current_step)?.clone();
        state.attempts += 1;
        state.touch();

        if state.verbose_logging {
            tracing::debug!(
                execution_id = %state.execution_id,
                correlation_id = %state.correlation_id.0,
                step = %step.id,
                kind = step.kind.name(),
                attempt = state.attempts,
                "Dispatching step"
            );
        }

        match &step.kind {
            StepKind::Fork(fork) => {
                let max_concurrency = fork.max_concurrency;
                match self.forker.fork(fork, state).await {
                    Ok(branches) => {
                        self.advance_position(flow, &step, state)?;
                        Ok(StepOutcome::ForkBranches {
                            branches,
                            max_concurrency,
                        })
                    }
                    Err(err) => self.handle_failure(flow, &step, state, err).await,
                }
            }
            StepKind::Aggregate(aggregate) => {
                match self.forker.aggregate(aggregate, state).await {
                    Ok(merged) => {
                        let outcome = self.finish_step(flow, &step, state, &merged).await?;
                        Ok(match outcome {
                            StepOutcome::Advance { next } => {
                                StepOutcome::AggregateComplete { next }
                            }
                            other => other,
                        })
                    }
                    Err(err) => self.handle_failure(flow, &step, state, err).await,
                }
            }
            StepKind::Poll(poll) => {
                let mut polling = match state.polling.take() {
                    Some(polling) => polling,
                    None => PollingLoop::new(poll.clone()),
                };

                match polling.advance(self.external.as_ref()).await {
                    Ok(PollTurn::Suspend(resume_after)) => {
                        state.polling = Some(polling);
                        // A clean suspend is not a failed attempt
                        state.reset_attempts();
                        state.suspend_for_timer()?;
                        self.trace.append(TraceEvent::new(
                            TracePhase::Polling,
                            TraceStatus::Ok,
                            "Polling loop suspended until next interval",
                            json!({
                                "step": step.id.0,
                                "resume_after_secs": resume_after.as_secs(),
                            }),
                        ));
                        Ok(StepOutcome::Suspended { resume_after })
                    }
                    Ok(PollTurn::Succeeded(response)) => {
                        state.polling = None;
                        self.finish_step(flow, &step, state, &response).await
                    }
                    Ok(PollTurn::Failed(message)) => {
                        state.polling = None;
                        self.handle_failure(
                            flow,
                            &step,
                            state,
                            EngineError::FlowExecution(message),
                        )
                        .await
                    }
                    Err(err) => {
                        // The loop resumes where it left off if a retry is
                        // granted
                        state.polling = Some(polling);
                        self.handle_failure(flow, &step, state, err).await
                    }
                }
            }
            StepKind::Logic
            | StepKind::DataLoad
            | StepKind::DataSave
            | StepKind::ApiCall
            | StepKind::LlmCall
            | StepKind::Message
            | StepKind::SubFlow => self.dispatch_module(flow, &step, state).await,
        }
    }

    async fn dispatch_module(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        state: &mut RuntimeState,
    ) -> Result<StepOutcome, EngineError> {
        let result = self.invoke_module(step, state).await;
        match result {
            Ok(output) => self.finish_step(flow, step, state, &output).await,
            Err(err) => self.handle_failure(flow, step, state, err).await,
        }
    }

    async fn invoke_module(
        &self,
        step: &StepInstance,
        state: &RuntimeState,
    ) -> Result<Value, EngineError> {
        let module = step.module.as_ref().ok_or_else(|| {
            EngineError::Configuration(format!("Step {} has no module identifier", step.id))
        })?;
        let handler = self.registry.get(module)?;
        let input = self.mapping.build_step_input(step, &state.context).await?;

        let ctx = StepContext {
            execution_id: state.execution_id.clone(),
            correlation_id: state.correlation_id.clone(),
            step: step.id.clone(),
            attempt: state.attempts,
        };
        let output = handler.invoke(input, &ctx).await;
        self.trace.append(TraceEvent::new(
            TracePhase::Dispatch,
            if output.is_ok() {
                TraceStatus::Ok
            } else {
                TraceStatus::Error
            },
            "Dispatched module handler",
            json!({
                "step": step.id.0,
                "module": module.0,
                "attempt": state.attempts,
            }),
        ));
        output
    }

    /// Success path shared by every step kind: apply output mappings, pick
    /// the next transition, advance or complete.
    async fn finish_step(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        state: &mut RuntimeState,
        output: &Value,
    ) -> Result<StepOutcome, EngineError> {
        match self
            .mapping
            .apply_step_output(step, &state.context, output)
            .await
        {
            Ok(context) => {
                state.context = context;
                match self.advance_position(flow, step, state) {
                    Ok(next) => Ok(StepOutcome::Advance { next }),
                    Err(err) => self.handle_failure(flow, step, state, err).await,
                }
            }
            Err(err) => self.handle_failure(flow, step, state, err).await,
        }
    }

    /// Move the execution to the selected transition target, or complete it
    /// when the step is terminal
    fn advance_position(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        state: &mut RuntimeState,
    ) -> Result<Option<StepId>, EngineError> {
        let next = self.select_transition(step, &state.context)?;
        match &next {
            Some(next_step) => {
                // Validated definitions cannot dangle, but the lookup stays
                flow.step(next_step)?;
                state.current_step = next_step.clone();
                state.reset_attempts();
            }
            None => state.complete()?,
        }
        Ok(next)
    }

    /// First transition whose condition evaluates truthy against the running
    /// context, else the default transition, else terminal
    fn select_transition(
        &self,
        step: &StepInstance,
        context: &RunningContext,
    ) -> Result<Option<StepId>, EngineError> {
        for transition in &step.transitions {
            let expr = jmespath::compile(&transition.condition).map_err(|e| {
                EngineError::Expression(format!(
                    "Invalid transition condition '{}': {}",
                    transition.condition, e
                ))
            })?;
            let result = expr.search(context.as_value()).map_err(|e| {
                EngineError::Expression(format!(
                    "Transition condition '{}' failed to evaluate: {}",
                    transition.condition, e
                ))
            })?;

            if result.is_truthy() {
                self.trace.append(TraceEvent::new(
                    TracePhase::Transition,
                    TraceStatus::Ok,
                    "Transition condition matched",
                    json!({
                        "step": step.id.0,
                        "condition": transition.condition,
                        "next": transition.next.0,
                    }),
                ));
                return Ok(Some(transition.next.clone()));
            }
        }

        Ok(step.default_next.clone())
    }

    /// Route a step failure through the error classifier and act on the
    /// decision
    async fn handle_failure(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        state: &mut RuntimeState,
        error: EngineError,
    ) -> Result<StepOutcome, EngineError> {
        let decision = self.classifier.decide(
            &step.error_policy,
            &error,
            state.attempts,
            state.content_attempts,
        );
        if error.kind() == ErrorKind::Content {
            state.content_attempts += 1;
        }

        self.trace.append(TraceEvent::new(
            TracePhase::Recovery,
            TraceStatus::Ok,
            "Classified step failure",
            json!({
                "step": step.id.0,
                "error": error.to_string(),
                "kind": error.kind(),
                "attempt": state.attempts,
                "decision": format!("{:?}", decision),
            }),
        ));

        match decision {
            RetryDecision::Retry { delay } => {
                tracing::info!(
                    execution_id = %state.execution_id,
                    step = %step.id,
                    attempt = state.attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %error,
                    "Retrying step after backoff"
                );
                state.suspend_for_timer()?;
                Ok(StepOutcome::Retry { delay })
            }
            RetryDecision::Fallback { step: fallback } => {
                tracing::info!(
                    execution_id = %state.execution_id,
                    step = %step.id,
                    fallback = %fallback,
                    error = %error,
                    "Diverting to fallback step"
                );
                state.polling = None;
                state.current_step = fallback.clone();
                state.reset_attempts();
                Ok(StepOutcome::Fallback { step: fallback })
            }
            RetryDecision::ContinueWithDefault => {
                tracing::info!(
                    execution_id = %state.execution_id,
                    step = %step.id,
                    error = %error,
                    "Continuing past failure with empty default output"
                );
                state.polling = None;
                // Empty output: mappings resolve nothing, context is
                // unchanged, and the normal transition path applies
                let context = self
                    .mapping
                    .apply_step_output(step, &state.context, &json!({}))
                    .await?;
                state.context = context;
                let next = self.advance_position(flow, step, state)?;
                Ok(StepOutcome::ContinueWithDefault { next })
            }
            RetryDecision::Fail => {
                state.polling = None;
                if error.kind() == ErrorKind::Cancellation {
                    state.cancel()?;
                    return Ok(StepOutcome::Cancelled);
                }
                let terminal = TerminalError {
                    kind: error.kind(),
                    message: error.to_string(),
                    step: step.id.clone(),
                };
                tracing::warn!(
                    execution_id = %state.execution_id,
                    step = %step.id,
                    kind = ?terminal.kind,
                    error = %error,
                    "Flow failed terminally"
                );
                state.fail(terminal.clone())?;
                Ok(StepOutcome::Fail { error: terminal })
            }
        }
    }

    /// Drive one execution to a terminal status in-process.
    ///
    /// Suspensions wait on the configured scheduler; fork branches are
    /// driven recursively with bounded concurrency, so nested forks work.
    pub fn run_to_terminal<'a>(
        &'a self,
        flow: &'a FlowDefinition,
        state: &'a mut RuntimeState,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        async move {
            while !state.status.is_terminal() {
                match self.advance(flow, state).await? {
                    StepOutcome::Advance { .. }
                    | StepOutcome::Fallback { .. }
                    | StepOutcome::ContinueWithDefault { .. }
                    | StepOutcome::AggregateComplete { .. }
                    | StepOutcome::Fail { .. }
                    | StepOutcome::Cancelled => {}
                    StepOutcome::ForkBranches {
                        branches,
                        max_concurrency,
                    } => {
                        self.run_branches(flow, state, branches, max_concurrency)
                            .await?;
                    }
                    StepOutcome::Suspended { resume_after }
                    | StepOutcome::Retry {
                        delay: resume_after,
                    } => {
                        self.scheduler
                            .schedule_resume(&state.execution_id, resume_after)
                            .await?;
                        state.resume()?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Drive fork branches to terminal with bounded concurrency and record
    /// their outcomes in the parent's branch table
    async fn run_branches(
        &self,
        flow: &FlowDefinition,
        parent: &mut RuntimeState,
        branches: Vec<RuntimeState>,
        max_concurrency: Option<usize>,
    ) -> Result<(), EngineError> {
        let concurrency = max_concurrency
            .unwrap_or(self.config.branch_concurrency)
            .max(1);

        let results: Vec<(BranchId, Result<(), EngineError>, RuntimeState)> =
            futures::stream::iter(branches.into_iter().map(|mut branch| async move {
                let id = BranchId(branch.execution_id.0.clone());
                let result = self.run_to_terminal(flow, &mut branch).await;
                (id, result, branch)
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (id, result, branch) in results {
            match result {
                Ok(()) if branch.status == FlowStatus::Completed => {
                    // The branch output is its whole terminal context
                    parent
                        .branches
                        .record_success(&id, branch.context.into_value())?;
                }
                Ok(()) if branch.status == FlowStatus::Cancelled => {
                    parent.branches.record_skip(&id)?;
                }
                Ok(()) => {
                    let message = branch
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "branch failed".to_string());
                    parent.branches.record_failure(&id, message)?;
                }
                Err(err) => {
                    parent.branches.record_failure(&id, err.to_string())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow_definition::{
        ErrorPolicy, FlowId, InputMapping, ModuleId, OutputMapping, Transition,
    };
    use crate::engine::registry::ModuleHandler;
    use crate::types::BufferingTraceSink;
    use conflux_object_store::InMemoryObjectStore;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoExternalCalls;

    #[async_trait]
    impl ExternalCall for NoExternalCalls {
        async fn call(&self, _descriptor: &Value) -> Result<Value, EngineError> {
            Err(EngineError::Configuration(
                "No external call capability configured".to_string(),
            ))
        }
    }

    struct DoubleModule;

    #[async_trait]
    impl ModuleHandler for DoubleModule {
        fn module_id(&self) -> ModuleId {
            ModuleId("math.double".to_string())
        }

        async fn invoke(&self, input: Value, _ctx: &StepContext) -> Result<Value, EngineError> {
            let n = input["n"].as_i64().ok_or_else(|| {
                EngineError::Validation("math.double needs a numeric n".to_string())
            })?;
            Ok(json!({"n": n * 2}))
        }
    }

    /// Fails with a transient error until the configured attempt
    struct FlakyModule {
        succeed_on: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModuleHandler for FlakyModule {
        fn module_id(&self) -> ModuleId {
            ModuleId("test.flaky".to_string())
        }

        async fn invoke(&self, _input: Value, _ctx: &StepContext) -> Result<Value, EngineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(json!({"recovered_on": call}))
            } else {
                Err(EngineError::Transient("upstream flapping".to_string()))
            }
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl ModuleHandler for AlwaysFails {
        fn module_id(&self) -> ModuleId {
            ModuleId("test.always_fails".to_string())
        }

        async fn invoke(&self, _input: Value, _ctx: &StepContext) -> Result<Value, EngineError> {
            Err(EngineError::Validation("rejected".to_string()))
        }
    }

    struct MarkerModule;

    #[async_trait]
    impl ModuleHandler for MarkerModule {
        fn module_id(&self) -> ModuleId {
            ModuleId("test.marker".to_string())
        }

        async fn invoke(&self, _input: Value, _ctx: &StepContext) -> Result<Value, EngineError> {
            Ok(json!({"marker": true}))
        }
    }

    fn orchestrator(registry: Arc<ModuleRegistry>) -> (StepOrchestrator, Arc<InMemoryScheduler>) {
        let scheduler = Arc::new(InMemoryScheduler::new());
        let orchestrator = StepOrchestrator::new(
            Arc::new(PayloadOffloader::new(
                Arc::new(InMemoryObjectStore::new()),
                1 << 20,
            )),
            registry,
            Arc::new(NoExternalCalls),
            scheduler.clone(),
            Arc::new(BufferingTraceSink::new()),
            OrchestratorConfig::new(8),
        );
        (orchestrator, scheduler)
    }

    fn step(id: &str, module: &str) -> StepInstance {
        StepInstance {
            id: StepId(id.to_string()),
            kind: StepKind::Logic,
            module: Some(ModuleId(module.to_string())),
            config: json!({}),
            input_mappings: Vec::new(),
            output_mappings: Vec::new(),
            error_policy: ErrorPolicy::default(),
            transitions: Vec::new(),
            default_next: None,
            extensions: HashMap::new(),
        }
    }

    fn flow_of(steps: Vec<StepInstance>, start: &str) -> FlowDefinition {
        let flow = FlowDefinition {
            id: FlowId("test_flow".to_string()),
            version: "1.0.0".to_string(),
            name: "Test Flow".to_string(),
            description: None,
            start_step: StepId(start.to_string()),
            steps: steps.into_iter().map(|s| (s.id.clone(), s)).collect(),
        };
        flow.validate().unwrap();
        flow
    }

    fn state_for(flow: &FlowDefinition, context: Value) -> RuntimeState {
        RuntimeState::new(flow.id.clone(), flow.start_step.clone(), context)
    }

    #[tokio::test]
    async fn test_linear_flow_runs_to_completion() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(DoubleModule));
        let (orchestrator, _) = orchestrator(registry);

        let mut first = step("double_once", "math.double");
        first.input_mappings.push(InputMapping {
            target: "n".to_string(),
            source: "seed".to_string(),
            required: true,
        });
        first.output_mappings.push(OutputMapping {
            target: "seed".to_string(),
            source: "n".to_string(),
        });
        first.default_next = Some(StepId("double_again".to_string()));

        let mut second = step("double_again", "math.double");
        second.input_mappings.push(InputMapping {
            target: "n".to_string(),
            source: "seed".to_string(),
            required: true,
        });
        second.output_mappings.push(OutputMapping {
            target: "result".to_string(),
            source: "n".to_string(),
        });

        let flow = flow_of(vec![first, second], "double_once");
        let mut state = state_for(&flow, json!({"seed": 3}));

        orchestrator.run_to_terminal(&flow, &mut state).await.unwrap();

        assert_eq!(state.status, FlowStatus::Completed);
        assert_eq!(state.context.as_value()["result"], 12);
    }

    #[tokio::test]
    async fn test_transition_condition_routes() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(MarkerModule));
        let (orchestrator, _) = orchestrator(registry);

        let mut gate = step("gate", "test.marker");
        gate.output_mappings.push(OutputMapping {
            target: "gate".to_string(),
            source: "$".to_string(),
        });
        gate.transitions.push(Transition {
            condition: "gate.marker".to_string(),
            next: StepId("on_marker".to_string()),
        });
        gate.default_next = Some(StepId("fallthrough".to_string()));

        let mut on_marker = step("on_marker", "test.marker");
        on_marker.output_mappings.push(OutputMapping {
            target: "routed".to_string(),
            source: "marker".to_string(),
        });
        let fallthrough = step("fallthrough", "test.marker");

        let flow = flow_of(vec![gate, on_marker, fallthrough], "gate");
        let mut state = state_for(&flow, json!({}));

        orchestrator.run_to_terminal(&flow, &mut state).await.unwrap();

        assert_eq!(state.status, FlowStatus::Completed);
        assert_eq!(state.context.as_value()["routed"], true);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_until_success() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(FlakyModule {
            succeed_on: 3,
            calls: AtomicU32::new(0),
        }));
        let (orchestrator, scheduler) = orchestrator(registry);

        let mut flaky = step("flaky", "test.flaky");
        flaky.error_policy.max_attempts = 5;
        flaky.error_policy.retry_interval_secs = 0.0;
        flaky.output_mappings.push(OutputMapping {
            target: "outcome".to_string(),
            source: "$".to_string(),
        });

        let flow = flow_of(vec![flaky], "flaky");
        let mut state = state_for(&flow, json!({}));

        orchestrator.run_to_terminal(&flow, &mut state).await.unwrap();

        assert_eq!(state.status, FlowStatus::Completed);
        assert_eq!(state.context.as_value()["outcome"]["recovered_on"], 3);
        // Two failed attempts scheduled two retry timers
        assert_eq!(scheduler.scheduled().len(), 2);
    }

    #[tokio::test]
    async fn test_continue_on_failure_advances_with_unchanged_context() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(AlwaysFails));
        registry.register(Arc::new(MarkerModule));
        let (orchestrator, _) = orchestrator(registry);

        let mut failing = step("failing", "test.always_fails");
        failing.error_policy.continue_on_failure = true;
        failing.output_mappings.push(OutputMapping {
            target: "never_set".to_string(),
            source: "anything".to_string(),
        });
        failing.default_next = Some(StepId("after".to_string()));

        let mut after = step("after", "test.marker");
        after.output_mappings.push(OutputMapping {
            target: "reached".to_string(),
            source: "marker".to_string(),
        });

        let flow = flow_of(vec![failing, after], "failing");
        let mut state = state_for(&flow, json!({"untouched": 1}));

        orchestrator.run_to_terminal(&flow, &mut state).await.unwrap();

        assert_eq!(state.status, FlowStatus::Completed);
        // The empty default output resolved nothing, so the context carries
        // no trace of the failed step
        assert_eq!(state.context.as_value()["untouched"], 1);
        assert!(state.context.as_value().get("never_set").is_none());
        assert_eq!(state.context.as_value()["reached"], true);
    }

    #[tokio::test]
    async fn test_exhausted_transient_retries_continue_past_the_step() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(FlakyModule {
            succeed_on: u32::MAX,
            calls: AtomicU32::new(0),
        }));
        registry.register(Arc::new(MarkerModule));
        let (orchestrator, scheduler) = orchestrator(registry);

        let mut flaky = step("flaky", "test.flaky");
        flaky.error_policy.max_attempts = 2;
        flaky.error_policy.retry_interval_secs = 0.0;
        flaky.error_policy.continue_on_failure = true;
        flaky.default_next = Some(StepId("after".to_string()));

        let mut after = step("after", "test.marker");
        after.output_mappings.push(OutputMapping {
            target: "reached".to_string(),
            source: "marker".to_string(),
        });

        let flow = flow_of(vec![flaky, after], "flaky");
        let mut state = state_for(&flow, json!({}));

        orchestrator.run_to_terminal(&flow, &mut state).await.unwrap();

        // One retry was granted, then the exhausted step continued with an
        // empty default output instead of failing the flow
        assert_eq!(state.status, FlowStatus::Completed);
        assert_eq!(state.context.as_value()["reached"], true);
        assert_eq!(scheduler.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_diverts_any_error_kind() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(AlwaysFails));
        registry.register(Arc::new(MarkerModule));
        let (orchestrator, _) = orchestrator(registry);

        let mut failing = step("failing", "test.always_fails");
        failing.error_policy.fallback_step = Some(StepId("recovery".to_string()));

        let mut recovery = step("recovery", "test.marker");
        recovery.output_mappings.push(OutputMapping {
            target: "recovered".to_string(),
            source: "marker".to_string(),
        });

        let flow = flow_of(vec![failing, recovery], "failing");
        let mut state = state_for(&flow, json!({}));

        orchestrator.run_to_terminal(&flow, &mut state).await.unwrap();

        assert_eq!(state.status, FlowStatus::Completed);
        assert_eq!(state.context.as_value()["recovered"], true);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_flow() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(FlakyModule {
            succeed_on: u32::MAX,
            calls: AtomicU32::new(0),
        }));
        let (orchestrator, _) = orchestrator(registry);

        let mut flaky = step("flaky", "test.flaky");
        flaky.error_policy.max_attempts = 2;
        flaky.error_policy.retry_interval_secs = 0.0;

        let flow = flow_of(vec![flaky], "flaky");
        let mut state = state_for(&flow, json!({}));

        orchestrator.run_to_terminal(&flow, &mut state).await.unwrap();

        assert_eq!(state.status, FlowStatus::Failed);
        let error = state.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Transient);
        assert_eq!(error.step, StepId("flaky".to_string()));
    }

    #[tokio::test]
    async fn test_cancellation_honored_at_step_boundary() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(MarkerModule));
        let (orchestrator, _) = orchestrator(registry);

        let flow = flow_of(vec![step("only", "test.marker")], "only");
        let mut state = state_for(&flow, json!({"kept": true}));
        state.request_cancel();

        let outcome = orchestrator.advance(&flow, &mut state).await.unwrap();

        assert!(matches!(outcome, StepOutcome::Cancelled));
        assert_eq!(state.status, FlowStatus::Cancelled);
        // Context keeps everything applied before the cancel
        assert_eq!(state.context.as_value()["kept"], true);
    }

    #[tokio::test]
    async fn test_missing_module_fails_as_configuration() {
        let (orchestrator, _) = orchestrator(Arc::new(ModuleRegistry::new()));

        let flow = flow_of(vec![step("orphan", "no.such.module")], "orphan");
        let mut state = state_for(&flow, json!({}));

        orchestrator.run_to_terminal(&flow, &mut state).await.unwrap();

        assert_eq!(state.status, FlowStatus::Failed);
        assert_eq!(state.error.as_ref().unwrap().kind, ErrorKind::Configuration);
    }
}
