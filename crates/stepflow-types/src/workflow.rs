//! Workflow definition types for Stepflow.
//!
//! Defines the canonical representation for workflows: a directed graph of
//! typed steps (`WorkflowStep` with a closed `StepKind` variant) connected by
//! conditional `Transition` edges. YAML files and programmatic construction
//! both produce this IR; it is the single source of truth for a workflow's
//! shape.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier (e.g. "daily-digest"). Unique per deployment.
    pub id: String,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    /// Human-readable workflow name.
    #[serde(default)]
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered list of top-level steps. Step IDs are unique across the whole
    /// definition, including steps nested inside composite kinds.
    pub steps: Vec<WorkflowStep>,
    /// ID of the step execution starts at.
    pub entry_step_id: String,
    /// Conditional edges between top-level steps. When empty, steps run in
    /// positional order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    /// Per-workflow timeout in milliseconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Extensible metadata (for future use / custom integrations).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Find a top-level step by ID.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a top-level step in declaration order.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
///
/// The variant payload is flattened, so YAML reads naturally:
/// ```yaml
/// - id: gather
///   name: Gather
///   type: agent
///   agent_id: researcher
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// User-defined step ID. Unique within a workflow.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// The kind of step plus its kind-specific configuration.
    #[serde(flatten)]
    pub kind: StepKind,
    /// Optional skip condition: when present and false, the step is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    /// Retry configuration for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Mappings applied to build the step's input from the context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_mappings: Vec<DataMapping>,
    /// Mappings applied to copy the step's output into the context output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_mappings: Vec<DataMapping>,
}

/// Closed set of step kinds. Unknown `type` tags are rejected at
/// definition-load time by serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a named agent from the external registry.
    Agent {
        agent_id: String,
        /// Static input merged beneath mapped input.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    /// Run child steps in declared order.
    Sequential {
        steps: Vec<WorkflowStep>,
        #[serde(default = "default_true")]
        stop_on_error: bool,
    },
    /// Run child steps concurrently in bounded chunks.
    Parallel {
        steps: Vec<WorkflowStep>,
        /// Chunk size; falls back to the executor config when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
        #[serde(default)]
        failure_strategy: FailureStrategy,
        /// Minimum number of children that must complete for the step to
        /// succeed (collect-all mode).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_successful: Option<usize>,
    },
    /// If/else branching on a condition.
    Conditional {
        condition: Condition,
        then_step: Box<WorkflowStep>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        else_step: Option<Box<WorkflowStep>>,
    },
    /// Iterate a body step: for-each over a collection, or while/until
    /// guarded, hard-capped by `max_iterations`.
    Loop {
        /// Context path resolving to an array (for-each mode).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
        /// Variable bound to the current item before each iteration.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_variable: Option<String>,
        /// Variable bound to the current index before each iteration.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index_variable: Option<String>,
        /// Checked before each iteration (while mode).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        while_condition: Option<Condition>,
        /// Checked after each iteration (until mode).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until_condition: Option<Condition>,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
        /// Cancellable sleep between iterations.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration_delay_ms: Option<u64>,
        body: Box<WorkflowStep>,
    },
    /// Reshape data from the context into a variable or output field.
    Transform {
        /// Context path of the input; defaults to the whole workflow input.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_variable: Option<String>,
        engine: TransformEngine,
        /// Engine-specific transform specification.
        spec: String,
        /// Destination path: `output.*` writes to the context output,
        /// anything else to variables.
        output_variable: String,
    },
    /// Pause the run for a fixed duration (other modes are unimplemented).
    Wait {
        #[serde(flatten)]
        mode: WaitMode,
    },
    /// Checkpoint gate: approval, manual/review, or quality thresholds.
    Gate {
        #[serde(flatten)]
        gate: GateKind,
    },
    /// Invoke another workflow. Not implemented; reserved extension seam
    /// consuming the engine contract recursively.
    Subworkflow {
        workflow_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
}

impl StepKind {
    /// Stable lowercase name of the kind, for logging and events.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Agent { .. } => "agent",
            StepKind::Sequential { .. } => "sequential",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Conditional { .. } => "conditional",
            StepKind::Loop { .. } => "loop",
            StepKind::Transform { .. } => "transform",
            StepKind::Wait { .. } => "wait",
            StepKind::Gate { .. } => "gate",
            StepKind::Subworkflow { .. } => "subworkflow",
        }
    }
}

/// Failure handling for parallel steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Abort the step as soon as any child in a chunk fails.
    FailFast,
    /// Settle every child and report failures as data.
    #[default]
    CollectAll,
}

/// Transform engines. Jsonpath/Jmespath are pass-through stubs in the
/// reference behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformEngine {
    Jsonpath,
    Jmespath,
    /// `${path}` substitution against the context.
    Template,
    /// JEXL expression evaluated against input + context.
    Expression,
}

/// Wait step modes. Only `Duration` is implemented; the others raise a typed
/// not-supported error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WaitMode {
    Duration { duration_ms: u64 },
    Event { event_name: String },
    Schedule { at: String },
    Approval { prompt: String },
}

/// Gate step kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum GateKind {
    /// Auto-approves (development-mode placeholder).
    Approval,
    /// Returns a pending result without blocking.
    Manual,
    /// Returns a pending result without blocking.
    Review,
    /// Compares numeric context metrics against thresholds.
    Quality {
        /// Context path -> minimum acceptable value.
        metrics: HashMap<String, f64>,
    },
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// A conditional edge between two top-level steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    /// A transition with no condition is unconditionally true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Higher priority is evaluated first.
    #[serde(default)]
    pub priority: i32,
    /// Fallback taken only when no non-default transition matched.
    #[serde(default)]
    pub is_default: bool,
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// A predicate over the workflow context: either a leaf comparison or a
/// recursive and/or group. Groups carry no negate flag; negate a group by
/// restructuring it (the leaf-only asymmetry is deliberate).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Group {
        logic: ConditionLogic,
        conditions: Vec<Condition>,
    },
    Leaf {
        /// Dotted context path with reserved prefixes `input.`, `output.`,
        /// `variables.`, `steps.`, `system.`; bare paths default to
        /// `variables.`.
        field: String,
        operator: ConditionOperator,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        /// Inverts the result after operator evaluation.
        #[serde(default)]
        negate: bool,
    },
}

/// Combinator for condition groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLogic {
    And,
    Or,
}

/// Leaf comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    Matches,
    Exists,
    IsEmpty,
    IsTrue,
    IsFalse,
}

// ---------------------------------------------------------------------------
// Data mappings
// ---------------------------------------------------------------------------

/// Declarative mapping from a context/output path to a target path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMapping {
    /// Source path. For input mappings this is a context path; for output
    /// mappings it is resolved against the step's output (or the context
    /// when it carries a reserved prefix).
    pub source: String,
    /// Target path in the built input (input mappings) or the context output
    /// (output mappings).
    pub target: String,
    /// Used when the source is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Missing + required is a configuration error.
    #[serde(default)]
    pub required: bool,
}

// ---------------------------------------------------------------------------
// Retry configuration
// ---------------------------------------------------------------------------

/// Retry configuration for a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt (default 100 ms).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff cap (default 30 s).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Exponential multiplier applied per attempt (default 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// When non-empty, only these error codes are retried.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_on: Vec<String>,
    /// Error codes never retried, checked before `retry_on`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub no_retry_on: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retry_on: Vec::new(),
            no_retry_on: Vec::new(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_iterations() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent_step(id: &str) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            name: id.to_string(),
            kind: StepKind::Agent {
                agent_id: "researcher".to_string(),
                input: None,
            },
            when: None,
            retry: None,
            input_mappings: vec![],
            output_mappings: vec![],
        }
    }

    /// Build a definition exercising every step kind.
    fn sample_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "daily-digest".to_string(),
            version: "1.0.0".to_string(),
            name: "Daily Digest".to_string(),
            description: Some("Gather, analyze, publish".to_string()),
            entry_step_id: "gather".to_string(),
            timeout_ms: Some(600_000),
            transitions: vec![Transition {
                from: "gather".to_string(),
                to: "fanout".to_string(),
                condition: None,
                priority: 0,
                is_default: true,
            }],
            metadata: HashMap::from([("created_by".to_string(), json!("tests"))]),
            steps: vec![
                agent_step("gather"),
                WorkflowStep {
                    id: "fanout".to_string(),
                    name: "Fan Out".to_string(),
                    kind: StepKind::Parallel {
                        steps: vec![agent_step("child-a"), agent_step("child-b")],
                        max_concurrency: Some(2),
                        failure_strategy: FailureStrategy::CollectAll,
                        min_successful: Some(1),
                    },
                    when: None,
                    retry: Some(RetryConfig::default()),
                    input_mappings: vec![],
                    output_mappings: vec![DataMapping {
                        source: "summary".to_string(),
                        target: "digest".to_string(),
                        default: None,
                        required: false,
                    }],
                },
                WorkflowStep {
                    id: "branch".to_string(),
                    name: "Branch".to_string(),
                    kind: StepKind::Conditional {
                        condition: Condition::Leaf {
                            field: "steps.gather.status".to_string(),
                            operator: ConditionOperator::Eq,
                            value: Some(json!("completed")),
                            negate: false,
                        },
                        then_step: Box::new(agent_step("then-child")),
                        else_step: None,
                    },
                    when: None,
                    retry: None,
                    input_mappings: vec![],
                    output_mappings: vec![],
                },
                WorkflowStep {
                    id: "pause".to_string(),
                    name: "Pause".to_string(),
                    kind: StepKind::Wait {
                        mode: WaitMode::Duration { duration_ms: 50 },
                    },
                    when: None,
                    retry: None,
                    input_mappings: vec![],
                    output_mappings: vec![],
                },
                WorkflowStep {
                    id: "quality".to_string(),
                    name: "Quality Gate".to_string(),
                    kind: StepKind::Gate {
                        gate: GateKind::Quality {
                            metrics: HashMap::from([(
                                "variables.score".to_string(),
                                0.8,
                            )]),
                        },
                    },
                    when: None,
                    retry: None,
                    input_mappings: vec![],
                    output_mappings: vec![],
                },
            ],
        }
    }

    // -----------------------------------------------------------------------
    // YAML / JSON roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn workflow_definition_yaml_roundtrip() {
        let original = sample_workflow();
        let yaml = serde_yaml_ng::to_string(&original).expect("serialize to YAML");

        assert!(yaml.contains("daily-digest"));
        assert!(yaml.contains("type: agent"));
        assert!(yaml.contains("type: parallel"));
        assert!(yaml.contains("mode: duration"));
        assert!(yaml.contains("gate: quality"));

        let parsed: WorkflowDefinition =
            serde_yaml_ng::from_str(&yaml).expect("deserialize from YAML");
        assert_eq!(parsed.id, "daily-digest");
        assert_eq!(parsed.steps.len(), 5);
        assert_eq!(parsed.entry_step_id, "gather");
        assert_eq!(parsed.transitions.len(), 1);
    }

    #[test]
    fn workflow_definition_json_roundtrip() {
        let original = sample_workflow();
        let text = serde_json::to_string_pretty(&original).expect("serialize to JSON");
        let parsed: WorkflowDefinition =
            serde_json::from_str(&text).expect("deserialize from JSON");
        assert_eq!(parsed.id, original.id);
        assert_eq!(parsed.steps.len(), original.steps.len());
    }

    #[test]
    fn unknown_step_type_rejected() {
        let yaml = r#"
id: wf
version: "1.0"
entry_step_id: a
steps:
  - id: a
    name: A
    type: quantum
"#;
        let result: Result<WorkflowDefinition, _> = serde_yaml_ng::from_str(yaml);
        assert!(result.is_err(), "unknown step type must fail to parse");
    }

    // -----------------------------------------------------------------------
    // Step kind serde
    // -----------------------------------------------------------------------

    #[test]
    fn step_kind_flattened_tag() {
        let step = agent_step("gather");
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"type\":\"agent\""));
        assert!(json.contains("\"agent_id\":\"researcher\""));
        let parsed: WorkflowStep = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed.kind, StepKind::Agent { .. }));
    }

    #[test]
    fn sequential_defaults_stop_on_error() {
        let yaml = r#"
id: seq
name: Seq
type: sequential
steps:
  - id: a
    name: A
    type: agent
    agent_id: bot
"#;
        let step: WorkflowStep = serde_yaml_ng::from_str(yaml).unwrap();
        match step.kind {
            StepKind::Sequential { stop_on_error, ref steps } => {
                assert!(stop_on_error, "stop_on_error defaults to true");
                assert_eq!(steps.len(), 1);
            }
            _ => panic!("expected sequential step"),
        }
    }

    #[test]
    fn loop_defaults_max_iterations() {
        let yaml = r#"
id: lp
name: Loop
type: loop
collection: variables.items
item_variable: item
body:
  id: body
  name: Body
  type: agent
  agent_id: bot
"#;
        let step: WorkflowStep = serde_yaml_ng::from_str(yaml).unwrap();
        match step.kind {
            StepKind::Loop { max_iterations, .. } => assert_eq!(max_iterations, 100),
            _ => panic!("expected loop step"),
        }
    }

    #[test]
    fn wait_mode_variants_serde() {
        let step = WorkflowStep {
            id: "w".to_string(),
            name: "W".to_string(),
            kind: StepKind::Wait {
                mode: WaitMode::Event {
                    event_name: "ready".to_string(),
                },
            },
            when: None,
            retry: None,
            input_mappings: vec![],
            output_mappings: vec![],
        };
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"mode\":\"event\""));
        let parsed: WorkflowStep = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed.kind,
            StepKind::Wait {
                mode: WaitMode::Event { .. }
            }
        ));
    }

    #[test]
    fn gate_kind_serde() {
        for (gate, tag) in [
            (GateKind::Approval, "\"gate\":\"approval\""),
            (GateKind::Manual, "\"gate\":\"manual\""),
            (GateKind::Review, "\"gate\":\"review\""),
        ] {
            let json = serde_json::to_string(&StepKind::Gate { gate }).unwrap();
            assert!(json.contains(tag), "got: {json}");
        }
    }

    // -----------------------------------------------------------------------
    // Conditions
    // -----------------------------------------------------------------------

    #[test]
    fn condition_leaf_serde() {
        let cond = Condition::Leaf {
            field: "output.count".to_string(),
            operator: ConditionOperator::Gte,
            value: Some(json!(3)),
            negate: false,
        };
        let json = serde_json::to_string(&cond).unwrap();
        assert!(json.contains("\"operator\":\"gte\""));
        let parsed: Condition = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, Condition::Leaf { .. }));
    }

    #[test]
    fn condition_operator_camel_names() {
        assert_eq!(
            serde_json::to_string(&ConditionOperator::NotIn).unwrap(),
            "\"notIn\""
        );
        assert_eq!(
            serde_json::to_string(&ConditionOperator::IsEmpty).unwrap(),
            "\"isEmpty\""
        );
        let parsed: ConditionOperator = serde_json::from_str("\"isTrue\"").unwrap();
        assert_eq!(parsed, ConditionOperator::IsTrue);
    }

    #[test]
    fn condition_group_nested_serde() {
        let cond: Condition = serde_json::from_value(json!({
            "logic": "and",
            "conditions": [
                { "field": "variables.ready", "operator": "isTrue" },
                {
                    "logic": "or",
                    "conditions": [
                        { "field": "output.count", "operator": "gt", "value": 0 },
                        { "field": "input.force", "operator": "isTrue" }
                    ]
                }
            ]
        }))
        .unwrap();

        match cond {
            Condition::Group { logic, conditions } => {
                assert_eq!(logic, ConditionLogic::And);
                assert_eq!(conditions.len(), 2);
                assert!(matches!(conditions[1], Condition::Group { .. }));
            }
            _ => panic!("expected group"),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions and retry defaults
    // -----------------------------------------------------------------------

    #[test]
    fn transition_defaults() {
        let t: Transition =
            serde_json::from_value(json!({ "from": "a", "to": "b" })).unwrap();
        assert_eq!(t.priority, 0);
        assert!(!t.is_default);
        assert!(t.condition.is_none());
    }

    #[test]
    fn retry_config_defaults() {
        let config: RetryConfig = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay_ms, 100);
        assert_eq!(config.max_delay_ms, 30_000);
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.retry_on.is_empty());
        assert!(config.no_retry_on.is_empty());
    }

    // -----------------------------------------------------------------------
    // Lookup helpers
    // -----------------------------------------------------------------------

    #[test]
    fn step_lookup_and_index() {
        let def = sample_workflow();
        assert!(def.step("gather").is_some());
        assert!(def.step("missing").is_none());
        assert_eq!(def.step_index("fanout"), Some(1));
    }
}
