//! Flow and step definitions
//!
//! A flow definition is an immutable, versioned graph of step instances.
//! It is produced by an external authoring process and is read-only to the
//! engine; `validate` is the gate every definition passes before execution.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;

/// Value object: Flow definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

/// Value object: Step instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

/// Value object: Module identifier, selects the handler for a step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleId(pub String);

impl Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a parsed and validated flow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// ID of the flow
    pub id: FlowId,

    /// The flow version
    pub version: String,

    /// Human-readable name of the flow
    pub name: String,

    /// Description of the flow
    pub description: Option<String>,

    /// Entry point of the flow graph
    pub start_step: StepId,

    /// The step instances in this flow, keyed by instance ID
    pub steps: HashMap<StepId, StepInstance>,
}

/// A node in the flow graph. Never mutated at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInstance {
    /// ID of this step instance
    pub id: StepId,

    /// Step kind, determines how the orchestrator treats this node
    pub kind: StepKind,

    /// Handler selector for module-backed kinds
    #[serde(default)]
    pub module: Option<ModuleId>,

    /// Static configuration, merged into step input before dynamic mappings
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,

    /// Rules building the step's input from the running context
    #[serde(default)]
    pub input_mappings: Vec<InputMapping>,

    /// Rules merging the step's output back into the running context
    #[serde(default)]
    pub output_mappings: Vec<OutputMapping>,

    /// Retry/fallback/continue policy applied when this step fails
    #[serde(default)]
    pub error_policy: ErrorPolicy,

    /// Ordered condition -> next-step transitions, evaluated first match wins
    #[serde(default)]
    pub transitions: Vec<Transition>,

    /// Transition taken when no condition matches. None makes the step terminal.
    #[serde(default)]
    pub default_next: Option<StepId>,

    /// Open-ended side-map for vendor/extension fields; the engine carries
    /// these untouched for forward compatibility
    #[serde(default)]
    pub extensions: HashMap<String, serde_json::Value>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Enumerated step categories. Adding a kind is a compile-time-checked
/// exercise: the orchestrator matches exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stepType", rename_all = "camelCase")]
pub enum StepKind {
    /// Arbitrary logic execution
    Logic,
    /// Load data from an external backend
    DataLoad,
    /// Persist data to an external backend
    DataSave,
    /// Call an external HTTP/RPC API
    ApiCall,
    /// Invoke an LLM provider
    LlmCall,
    /// Send a message (queue, pub-sub, email)
    Message,
    /// Invoke another flow as a step
    SubFlow,
    /// Split the context into parallel branch contexts
    Fork(ForkConfig),
    /// Merge completed branch outputs
    Aggregate(AggregateConfig),
    /// Repeatedly invoke an external call until an exit condition holds
    Poll(PollingConfig),
}

impl StepKind {
    /// Whether this kind dispatches to a registered module handler
    pub fn is_module_backed(&self) -> bool {
        !matches!(
            self,
            StepKind::Fork(_) | StepKind::Aggregate(_) | StepKind::Poll(_)
        )
    }

    /// Kind name for logging and trace records
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Logic => "logic",
            StepKind::DataLoad => "dataLoad",
            StepKind::DataSave => "dataSave",
            StepKind::ApiCall => "apiCall",
            StepKind::LlmCall => "llmCall",
            StepKind::Message => "message",
            StepKind::SubFlow => "subFlow",
            StepKind::Fork(_) => "fork",
            StepKind::Aggregate(_) => "aggregate",
            StepKind::Poll(_) => "poll",
        }
    }
}

/// Input-mapping rule: resolve `source` against the hydrated context and
/// assign the result at `target` in the step input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMapping {
    /// Path in the step input object to assign
    pub target: String,

    /// Path expression resolved against the running context
    pub source: String,

    /// Missing required sources are a fatal schema-validation failure;
    /// missing optional sources are skipped
    #[serde(default)]
    pub required: bool,
}

/// Output-mapping rule: resolve `source` against the step output and
/// deep-merge the result at `target` in the running context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMapping {
    /// Path in the running context to merge into
    pub target: String,

    /// Path expression resolved against the step output
    pub source: String,
}

/// Condition -> next-step pair. Conditions are JMESPath expressions
/// evaluated against the running context; a truthy result takes the edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// JMESPath condition expression
    pub condition: String,

    /// Step to advance to when the condition holds
    pub next: StepId,
}

/// Error-handling policy for one step.
///
/// Out-of-range values are clamped by `RetryBounds` at decision time, not
/// rejected at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorPolicy {
    /// Total attempt budget for transient failures (1 = no retry)
    pub max_attempts: u32,

    /// Base retry interval in seconds
    pub retry_interval_secs: f64,

    /// Exponential backoff multiplier applied per attempt
    pub backoff_rate: f64,

    /// Separate, smaller budget for content errors
    pub content_retry_budget: u32,

    /// Error names retried even when not classified transient
    pub retry_on: Vec<String>,

    /// Alternate step to transition to once retries are exhausted
    pub fallback_step: Option<StepId>,

    /// Continue with an empty output instead of failing the flow
    pub continue_on_failure: bool,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_interval_secs: 5.0,
            backoff_rate: 2.0,
            content_retry_budget: 0,
            retry_on: Vec::new(),
            fallback_step: None,
            continue_on_failure: false,
        }
    }
}

/// Configuration for a fork step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkConfig {
    /// Path to the source array in the running context
    pub source: String,

    /// Path in each branch context where the element is injected
    pub item_target: String,

    /// Step each branch starts at
    pub branch_start: StepId,

    /// Ceiling on concurrently executing branches. No default is prescribed;
    /// callers must set one when driving branches in-process.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

/// Configuration for an aggregate step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateConfig {
    /// How branch outputs are merged
    pub strategy: AggregationStrategy,
}

/// Declared strategy for merging branch outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationStrategy {
    /// Deep-merge all branch outputs into one object. Conflicting keys
    /// resolve last-completed-wins, which is completion-order dependent;
    /// callers must not rely on it for conflicting keys.
    MergeObjects,
    /// Collect outputs into an array preserving branch launch order
    CollectArray,
    /// Numeric reduction over a configured field of each branch output
    Sum {
        /// Path to the numeric field within each branch output
        field: String,
    },
    /// Delegate reduction to a registered module
    CustomModule {
        /// Module that receives all branch outputs and produces the merge
        module: ModuleId,
    },
}

/// Configuration for a polling-loop step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    /// Opaque descriptor handed to the external call capability
    pub call: serde_json::Value,

    /// Seconds to wait between invocations
    pub interval_secs: u64,

    /// Maximum number of invocations before the loop fails
    pub max_attempts: u32,

    /// Path expression on the response; truthy means terminal success
    pub success_condition: String,

    /// Path expression on the response; truthy means terminal failure
    pub failure_condition: String,
}

impl FlowDefinition {
    /// Look up a step instance by ID
    pub fn step(&self, id: &StepId) -> Result<&StepInstance, EngineError> {
        self.steps
            .get(id)
            .ok_or_else(|| EngineError::StepNotFound(id.0.clone()))
    }

    /// Validate the flow definition.
    ///
    /// Every transition target, fallback reference, and fork branch entry
    /// must resolve within this definition. Loops via explicit transitions
    /// are legal, so there is deliberately no acyclicity check.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::Validation(
                "Flow must have at least one step".to_string(),
            ));
        }

        if !self.steps.contains_key(&self.start_step) {
            return Err(EngineError::Validation(format!(
                "Start step does not exist: {}",
                self.start_step
            )));
        }

        for (key, step) in &self.steps {
            if key != &step.id {
                return Err(EngineError::Validation(format!(
                    "Step map key {} does not match instance id {}",
                    key, step.id
                )));
            }

            if step.kind.is_module_backed() && step.module.is_none() {
                return Err(EngineError::Validation(format!(
                    "Step {} has kind {} but no module identifier",
                    step.id,
                    step.kind.name()
                )));
            }

            if !step.config.is_object() {
                return Err(EngineError::Validation(format!(
                    "Step {} config must be an object",
                    step.id
                )));
            }

            for transition in &step.transitions {
                self.check_reference(&step.id, "transition target", &transition.next)?;
            }
            if let Some(next) = &step.default_next {
                self.check_reference(&step.id, "default transition", next)?;
            }
            if let Some(fallback) = &step.error_policy.fallback_step {
                self.check_reference(&step.id, "fallback step", fallback)?;
            }
            if let StepKind::Fork(fork) = &step.kind {
                self.check_reference(&step.id, "fork branch start", &fork.branch_start)?;
            }
        }

        Ok(())
    }

    fn check_reference(
        &self,
        from: &StepId,
        what: &str,
        target: &StepId,
    ) -> Result<(), EngineError> {
        if self.steps.contains_key(target) {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "Step {} references non-existent {}: {}",
                from, what, target
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn logic_step(id: &str) -> StepInstance {
        StepInstance {
            id: StepId(id.to_string()),
            kind: StepKind::Logic,
            module: Some(ModuleId("logic.noop".to_string())),
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
        FlowDefinition {
            id: FlowId("test_flow".to_string()),
            version: "1.0.0".to_string(),
            name: "Test Flow".to_string(),
            description: None,
            start_step: StepId(start.to_string()),
            steps: steps.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    #[test]
    fn test_validate_empty_steps() {
        let flow = flow_of(Vec::new(), "missing");
        let result = flow.validate();
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_validate_missing_start_step() {
        let flow = flow_of(vec![logic_step("a")], "not_a");
        let result = flow.validate();
        match result {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("Start step")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_dangling_transition() {
        let mut step = logic_step("a");
        step.transitions.push(Transition {
            condition: "done".to_string(),
            next: StepId("ghost".to_string()),
        });
        let flow = flow_of(vec![step], "a");

        match flow.validate() {
            Err(EngineError::Validation(msg)) => {
                assert!(msg.contains("transition target"));
                assert!(msg.contains("ghost"));
            }
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_dangling_fallback() {
        let mut step = logic_step("a");
        step.error_policy.fallback_step = Some(StepId("ghost".to_string()));
        let flow = flow_of(vec![step], "a");

        match flow.validate() {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("fallback step")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_module_backed_without_module() {
        let mut step = logic_step("a");
        step.module = None;
        let flow = flow_of(vec![step], "a");

        match flow.validate() {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("no module identifier")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_allows_loops() {
        let mut a = logic_step("a");
        a.default_next = Some(StepId("b".to_string()));
        let mut b = logic_step("b");
        // Explicit back-edge; loops via transitions are legal
        b.transitions.push(Transition {
            condition: "again".to_string(),
            next: StepId("a".to_string()),
        });

        let flow = flow_of(vec![a, b], "a");
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn test_validate_fork_branch_start() {
        let mut fork = logic_step("fork");
        fork.kind = StepKind::Fork(ForkConfig {
            source: "items".to_string(),
            item_target: "branch.item".to_string(),
            branch_start: StepId("ghost".to_string()),
            max_concurrency: Some(4),
        });
        fork.module = None;
        let flow = flow_of(vec![fork], "fork");

        match flow.validate() {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("fork branch start")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_step_kind_serde_tag() {
        let kind = StepKind::Poll(PollingConfig {
            call: json!({"url": "https://api.example.com/job/42"}),
            interval_secs: 30,
            max_attempts: 10,
            success_condition: "status_done".to_string(),
            failure_condition: "status_failed".to_string(),
        });

        let serialized = serde_json::to_value(&kind).unwrap();
        assert_eq!(serialized["stepType"], "poll");
        assert_eq!(serialized["intervalSecs"], 30);

        let round_tripped: StepKind = serde_json::from_value(serialized).unwrap();
        assert_eq!(round_tripped, kind);
    }

    #[test]
    fn test_aggregation_strategy_serde_names() {
        let merge = serde_json::to_value(AggregationStrategy::MergeObjects).unwrap();
        assert_eq!(merge["type"], "MERGE_OBJECTS");

        let sum = serde_json::to_value(AggregationStrategy::Sum {
            field: "total".to_string(),
        })
        .unwrap();
        assert_eq!(sum["type"], "SUM");

        let collect: AggregationStrategy =
            serde_json::from_value(json!({"type": "COLLECT_ARRAY"})).unwrap();
        assert_eq!(collect, AggregationStrategy::CollectArray);
    }

    #[test]
    fn test_error_policy_defaults() {
        let policy = ErrorPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.retry_interval_secs, 5.0);
        assert_eq!(policy.backoff_rate, 2.0);
        assert_eq!(policy.content_retry_budget, 0);
        assert!(!policy.continue_on_failure);
        assert!(policy.fallback_step.is_none());
    }

    #[test]
    fn test_step_instance_extensions_round_trip() {
        let raw = json!({
            "id": "a",
            "kind": {"stepType": "logic"},
            "module": "logic.noop",
            "extensions": {"x-vendor": {"team": "payments"}}
        });

        let step: StepInstance = serde_json::from_value(raw).unwrap();
        assert_eq!(step.extensions["x-vendor"]["team"], "payments");
        assert_eq!(step.kind, StepKind::Logic);
    }
}
