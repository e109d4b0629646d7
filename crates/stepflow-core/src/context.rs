//! Workflow execution context: the mutable state that flows through a run.
//!
//! Holds the immutable workflow input, the accumulating output, user
//! variables, per-step results, and system metadata. All reads go through
//! dotted paths with reserved prefixes (`input.`, `output.`, `variables.`,
//! `steps.`, `system.`); bare paths default to `variables.`. Size limits keep
//! runaway step outputs from growing the context without bound.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stepflow_types::execution::StepResult;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Errors from context mutation.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("total context size ({actual} bytes) exceeds maximum ({max} bytes)")]
    Overflow { actual: usize, max: usize },

    #[error("context serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// System metadata
// ---------------------------------------------------------------------------

/// Read-only run metadata exposed under the `system.` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_version: String,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Mutable execution context for one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Caller-supplied input. Immutable for the duration of the run.
    pub input: Value,
    /// Accumulating workflow output, written by output mappings and
    /// `output.*` transform targets.
    pub output: serde_json::Map<String, Value>,
    /// User-defined variables.
    pub variables: HashMap<String, Value>,
    /// Results of settled steps keyed by step ID.
    pub step_results: HashMap<String, StepResult>,
    /// Run metadata.
    pub system: SystemInfo,
}

impl WorkflowContext {
    pub fn new(system: SystemInfo, input: Value) -> Self {
        Self {
            input,
            output: serde_json::Map::new(),
            variables: HashMap::new(),
            step_results: HashMap::new(),
            system,
        }
    }

    // -----------------------------------------------------------------------
    // Path resolution
    // -----------------------------------------------------------------------

    /// Resolve a dotted path against the context.
    ///
    /// Reserved prefixes select a section; a bare path reads from variables.
    /// Returns `None` when any segment along the way is absent.
    pub fn resolve_path(&self, path: &str) -> Option<Value> {
        if let Some(rest) = path.strip_prefix("input.") {
            return navigate(&self.input, rest).cloned();
        }
        if path == "input" {
            return Some(self.input.clone());
        }
        if let Some(rest) = path.strip_prefix("output.") {
            return navigate(&Value::Object(self.output.clone()), rest).cloned();
        }
        if path == "output" {
            return Some(Value::Object(self.output.clone()));
        }
        if let Some(rest) = path.strip_prefix("variables.") {
            return self.resolve_in_variables(rest);
        }
        if let Some(rest) = path.strip_prefix("steps.") {
            return self.resolve_in_steps(rest);
        }
        if let Some(rest) = path.strip_prefix("system.") {
            let system = serde_json::to_value(&self.system).ok()?;
            return navigate(&system, rest).cloned();
        }
        self.resolve_in_variables(path)
    }

    fn resolve_in_variables(&self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            Some((name, rest)) => navigate(self.variables.get(name)?, rest).cloned(),
            None => self.variables.get(path).cloned(),
        }
    }

    fn resolve_in_steps(&self, path: &str) -> Option<Value> {
        let (step_id, rest) = match path.split_once('.') {
            Some((id, rest)) => (id, Some(rest)),
            None => (path, None),
        };
        let result = self.step_results.get(step_id)?;
        let view = step_result_view(result);
        match rest {
            Some(rest) => navigate(&view, rest).cloned(),
            None => Some(view),
        }
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Set a variable (or a nested field of one when the name is dotted).
    pub fn set_variable(&mut self, name: &str, value: Value) {
        match name.split_once('.') {
            Some((head, rest)) => {
                let root = self
                    .variables
                    .entry(head.to_string())
                    .or_insert_with(|| json!({}));
                set_nested(root, rest, value);
            }
            None => {
                self.variables.insert(name.to_string(), value);
            }
        }
    }

    /// Write a field of the workflow output. Dotted paths create nested
    /// objects as needed.
    pub fn set_output(&mut self, path: &str, value: Value) {
        match path.split_once('.') {
            Some((head, rest)) => {
                let root = self
                    .output
                    .entry(head.to_string())
                    .or_insert_with(|| json!({}));
                set_nested(root, rest, value);
            }
            None => {
                self.output.insert(path.to_string(), value);
            }
        }
    }

    /// Record a settled step result.
    ///
    /// Outputs larger than `MAX_STEP_OUTPUT_SIZE` are replaced with a
    /// truncation marker; a context that grows past `MAX_CONTEXT_SIZE` fails
    /// the write.
    pub fn record_step_result(&mut self, mut result: StepResult) -> Result<(), ContextError> {
        if let Some(output) = result.output.take() {
            let serialized = serde_json::to_string(&output)
                .map_err(|e| ContextError::Serialization(e.to_string()))?;

            if serialized.len() > MAX_STEP_OUTPUT_SIZE {
                tracing::warn!(
                    step_id = %result.step_id,
                    size = serialized.len(),
                    max = MAX_STEP_OUTPUT_SIZE,
                    "step output exceeds size limit, truncating"
                );
                result.output = Some(json!({
                    "_truncated": true,
                    "_original_size": serialized.len(),
                    "_message": format!(
                        "output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"
                    )
                }));
            } else {
                result.output = Some(output);
            }
        }

        self.step_results.insert(result.step_id.clone(), result);

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::Overflow {
                actual: total,
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(())
    }

    /// Result of a settled step, if any.
    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    /// Merge step results recorded by a parallel child back into this
    /// context. Child variables are deliberately not merged.
    pub fn merge_step_results(&mut self, other: WorkflowContext) {
        for (id, result) in other.step_results {
            self.step_results.entry(id).or_insert(result);
        }
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    /// Substitute `${path}` placeholders in a string. Unresolvable
    /// placeholders are left as-is.
    pub fn resolve_template(&self, template: &str) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(close) => {
                    let path = after[..close].trim();
                    match self.resolve_path(path) {
                        Some(value) => result.push_str(&value_to_string(&value)),
                        None => {
                            result.push_str(&rest[start..start + 2 + close + 1]);
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    result.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        result.push_str(rest);
        result
    }

    /// Substitute templates recursively through a JSON value. A string that
    /// is exactly one placeholder resolves to the raw value, preserving its
    /// type; mixed strings resolve to text.
    pub fn resolve_templates_in(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                let trimmed = s.trim();
                if let Some(inner) = trimmed
                    .strip_prefix("${")
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    // whole-string placeholder keeps the resolved type
                    if !inner.contains("${") {
                        if let Some(resolved) = self.resolve_path(inner.trim()) {
                            return resolved;
                        }
                        return value.clone();
                    }
                }
                Value::String(self.resolve_template(s))
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_templates_in(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_templates_in(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Total serialized size of the context payload sections in bytes.
    pub fn total_size(&self) -> usize {
        let input = json_len(&self.input);
        let output: usize = self.output.values().map(json_len).sum();
        let variables: usize = self.variables.values().map(json_len).sum();
        let steps: usize = self
            .step_results
            .values()
            .filter_map(|r| r.output.as_ref())
            .map(json_len)
            .sum();
        input + output + variables + steps
    }

    /// Serialize the entire context for persistence.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }

    /// The accumulated workflow output as a value.
    pub fn output_value(&self) -> Value {
        Value::Object(self.output.clone())
    }

    /// Flat JSON object for JEXL expression evaluation.
    ///
    /// Shape: `{ "input": ..., "output": ..., "variables": ..., "steps":
    /// { "<id>": { "status", "output", ... } }, "system": ... }`.
    pub fn to_expression_context(&self) -> Value {
        let mut steps = serde_json::Map::new();
        for (id, result) in &self.step_results {
            steps.insert(id.clone(), step_result_view(result));
        }
        json!({
            "input": self.input,
            "output": self.output,
            "variables": self.variables,
            "steps": steps,
            "system": serde_json::to_value(&self.system).unwrap_or(json!({})),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Walk a dotted path through a JSON value. Numeric segments index arrays.
fn navigate<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write a dotted path into a JSON value, creating intermediate objects.
fn set_nested(root: &mut Value, path: &str, value: Value) {
    match path.split_once('.') {
        Some((head, rest)) => {
            if !root.is_object() {
                *root = json!({});
            }
            let map = root.as_object_mut().unwrap_or_else(|| unreachable!());
            let child = map.entry(head.to_string()).or_insert_with(|| json!({}));
            set_nested(child, rest, value);
        }
        None => {
            if !root.is_object() {
                *root = json!({});
            }
            if let Some(map) = root.as_object_mut() {
                map.insert(path.to_string(), value);
            }
        }
    }
}

/// The JSON view of a step result exposed under `steps.<id>`.
fn step_result_view(result: &StepResult) -> Value {
    json!({
        "status": result.status.to_string(),
        "output": result.output.clone().unwrap_or(Value::Null),
        "error": result.error.as_ref().map(|e| json!({
            "code": e.code,
            "message": e.message,
            "retryable": e.retryable,
        })),
        "attempts": result.attempts,
        "duration_ms": result.duration_ms,
    })
}

fn json_len(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

/// Convert a JSON value to a display string for template substitution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // objects and arrays render as compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_types::execution::{StepResult, StepStatus};

    fn test_context() -> WorkflowContext {
        let system = SystemInfo {
            execution_id: Uuid::now_v7(),
            workflow_id: "daily-digest".to_string(),
            workflow_name: "Daily Digest".to_string(),
            workflow_version: "1.0.0".to_string(),
            started_at: Utc::now(),
        };
        WorkflowContext::new(system, json!({ "topic": "rust", "count": 5 }))
    }

    fn completed_step(id: &str, output: Value) -> StepResult {
        let mut result = StepResult::started(id).finish(StepStatus::Completed);
        result.output = Some(output);
        result.attempts = 1;
        result
    }

    // -----------------------------------------------------------------------
    // Path resolution
    // -----------------------------------------------------------------------

    #[test]
    fn resolves_input_paths() {
        let ctx = test_context();
        assert_eq!(ctx.resolve_path("input.topic"), Some(json!("rust")));
        assert_eq!(ctx.resolve_path("input.missing"), None);
        assert_eq!(ctx.resolve_path("input"), Some(json!({ "topic": "rust", "count": 5 })));
    }

    #[test]
    fn bare_paths_read_variables() {
        let mut ctx = test_context();
        ctx.set_variable("score", json!(0.9));
        assert_eq!(ctx.resolve_path("score"), Some(json!(0.9)));
        assert_eq!(ctx.resolve_path("variables.score"), Some(json!(0.9)));
    }

    #[test]
    fn resolves_nested_variable_paths() {
        let mut ctx = test_context();
        ctx.set_variable("report", json!({ "sections": ["intro", "body"] }));
        assert_eq!(
            ctx.resolve_path("variables.report.sections.1"),
            Some(json!("body"))
        );
    }

    #[test]
    fn resolves_step_result_fields() {
        let mut ctx = test_context();
        ctx.record_step_result(completed_step("gather", json!({ "items": 3 })))
            .unwrap();

        assert_eq!(
            ctx.resolve_path("steps.gather.status"),
            Some(json!("completed"))
        );
        assert_eq!(
            ctx.resolve_path("steps.gather.output.items"),
            Some(json!(3))
        );
        assert_eq!(ctx.resolve_path("steps.missing.status"), None);
    }

    #[test]
    fn resolves_system_fields() {
        let ctx = test_context();
        assert_eq!(
            ctx.resolve_path("system.workflow_id"),
            Some(json!("daily-digest"))
        );
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    #[test]
    fn set_output_creates_nested_objects() {
        let mut ctx = test_context();
        ctx.set_output("digest.title", json!("Morning Digest"));
        ctx.set_output("digest.count", json!(7));
        assert_eq!(
            ctx.resolve_path("output.digest.title"),
            Some(json!("Morning Digest"))
        );
        assert_eq!(ctx.resolve_path("output.digest.count"), Some(json!(7)));
    }

    #[test]
    fn dotted_variable_writes_nest() {
        let mut ctx = test_context();
        ctx.set_variable("stats.total", json!(10));
        assert_eq!(ctx.resolve_path("variables.stats.total"), Some(json!(10)));
    }

    #[test]
    fn oversized_step_output_truncated() {
        let mut ctx = test_context();
        let big = "x".repeat(MAX_STEP_OUTPUT_SIZE + 100);
        ctx.record_step_result(completed_step("big", json!(big)))
            .unwrap();

        let output = ctx.resolve_path("steps.big.output").unwrap();
        assert_eq!(output["_truncated"], json!(true));
    }

    #[test]
    fn merge_keeps_existing_results() {
        let mut a = test_context();
        a.record_step_result(completed_step("shared", json!("from-a")))
            .unwrap();

        let mut b = test_context();
        b.record_step_result(completed_step("shared", json!("from-b")))
            .unwrap();
        b.record_step_result(completed_step("only-b", json!("b")))
            .unwrap();

        a.merge_step_results(b);
        assert_eq!(
            a.resolve_path("steps.shared.output"),
            Some(json!("from-a"))
        );
        assert_eq!(a.resolve_path("steps.only-b.output"), Some(json!("b")));
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    #[test]
    fn resolves_string_templates() {
        let mut ctx = test_context();
        ctx.set_variable("name", json!("world"));
        assert_eq!(
            ctx.resolve_template("hello ${variables.name}, topic=${input.topic}"),
            "hello world, topic=rust"
        );
    }

    #[test]
    fn unresolvable_placeholder_left_asis() {
        let ctx = test_context();
        assert_eq!(
            ctx.resolve_template("value: ${variables.missing}"),
            "value: ${variables.missing}"
        );
    }

    #[test]
    fn whole_string_placeholder_keeps_type() {
        let ctx = test_context();
        let resolved = ctx.resolve_templates_in(&json!({
            "count": "${input.count}",
            "label": "topic is ${input.topic}"
        }));
        assert_eq!(resolved["count"], json!(5));
        assert_eq!(resolved["label"], json!("topic is rust"));
    }

    // -----------------------------------------------------------------------
    // Expression context
    // -----------------------------------------------------------------------

    #[test]
    fn expression_context_shape() {
        let mut ctx = test_context();
        ctx.set_variable("score", json!(0.9));
        ctx.record_step_result(completed_step("gather", json!("news")))
            .unwrap();

        let expr = ctx.to_expression_context();
        assert_eq!(expr["input"]["topic"], json!("rust"));
        assert_eq!(expr["variables"]["score"], json!(0.9));
        assert_eq!(expr["steps"]["gather"]["output"], json!("news"));
        assert_eq!(expr["system"]["workflow_id"], json!("daily-digest"));
    }
}
