//! JEXL expression evaluation for transform steps.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms.
//! Data is always passed as a context object, never interpolated into the
//! expression string.

use serde_json::{Value, json};

use crate::context::WorkflowContext;

/// Errors from expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// JEXL expression evaluator with standard transforms pre-registered.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("join", |args: &[Value]| {
                let items = args.first().and_then(|v| v.as_array()).cloned().unwrap_or_default();
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<String> = items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                Ok(json!(parts.join(delimiter)))
            })
            // Boolean transforms
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            // String search transforms
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Length transform (strings, arrays, objects)
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate a transform expression against a workflow context.
    ///
    /// The expression sees `input`, `output`, `variables`, `steps`, and
    /// `system` sections plus the transform input bound as `value`.
    pub fn evaluate_transform(
        &self,
        expression: &str,
        input: &Value,
        ctx: &WorkflowContext,
    ) -> Result<Value, ExpressionError> {
        let mut context = ctx.to_expression_context();
        if let Some(map) = context.as_object_mut() {
            map.insert("value".to_string(), input.clone());
        }
        self.evaluate_value(expression, &context)
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SystemInfo;
    use chrono::Utc;
    use uuid::Uuid;

    fn evaluator() -> ExpressionEvaluator {
        ExpressionEvaluator::new()
    }

    fn test_context() -> WorkflowContext {
        let system = SystemInfo {
            execution_id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
            workflow_name: "wf".to_string(),
            workflow_version: "1.0".to_string(),
            started_at: Utc::now(),
        };
        WorkflowContext::new(system, json!({ "topic": "rust" }))
    }

    #[test]
    fn dot_notation_nested() {
        let ctx = json!({ "report": { "author": { "name": "Alice" } } });
        let result = evaluator()
            .evaluate_value("report.author.name", &ctx)
            .unwrap();
        assert_eq!(result, json!("Alice"));
    }

    #[test]
    fn transform_chaining() {
        let ctx = json!({ "name": "  Hello World  " });
        let result = evaluator().evaluate_value("name|trim|lower", &ctx).unwrap();
        assert_eq!(result, json!("hello world"));
    }

    #[test]
    fn transform_split_and_join() {
        let ctx = json!({ "csv": "a,b,c" });
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_value("csv|split(',')", &ctx).unwrap(),
            json!(["a", "b", "c"])
        );
        assert_eq!(
            eval.evaluate_value("csv|split(',')|join('-')", &ctx).unwrap(),
            json!("a-b-c")
        );
    }

    #[test]
    fn transform_length_comparison() {
        let ctx = json!({ "items": ["a", "b", "c"] });
        let result = evaluator().evaluate_value("items|length > 2", &ctx).unwrap();
        assert_eq!(result, json!(true));
    }

    #[test]
    fn ternary_expression() {
        let ctx = json!({ "count": 10.0 });
        let result = evaluator()
            .evaluate_value("(count > 5) ? 'high' : 'low'", &ctx)
            .unwrap();
        assert_eq!(result, json!("high"));
    }

    #[test]
    fn missing_property_is_null() {
        let ctx = json!({ "report": {} });
        let result = evaluator().evaluate_value("report.nonexistent", &ctx).unwrap();
        assert_eq!(result, json!(null));
    }

    #[test]
    fn non_object_context_rejected() {
        let ctx = json!("not an object");
        assert!(evaluator().evaluate_value("true", &ctx).is_err());
    }

    #[test]
    fn transform_sees_bound_value_and_context() {
        let mut ctx = test_context();
        ctx.set_variable("suffix", json!("!"));
        let result = evaluator()
            .evaluate_transform("value|upper", &json!("hello"), &ctx)
            .unwrap();
        assert_eq!(result, json!("HELLO"));

        let result = evaluator()
            .evaluate_transform("input.topic", &json!(null), &ctx)
            .unwrap();
        assert_eq!(result, json!("rust"));
    }
}
