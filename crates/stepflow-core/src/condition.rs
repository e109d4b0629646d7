//! Structured condition evaluation against the workflow context.
//!
//! Conditions are data, not code: a leaf names a context path, an operator,
//! and an optional comparison value; groups combine children with and/or.
//! Absent paths never panic and never error. Each operator has a defined
//! result for a missing value, and `negate` applies after the operator.

use regex::Regex;
use serde_json::Value;
use stepflow_types::workflow::{Condition, ConditionLogic, ConditionOperator};
use thiserror::Error;

use crate::context::WorkflowContext;

/// Errors from malformed conditions. These are definition problems, not data
/// problems, and map to configuration errors upstream.
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("operator '{0:?}' requires a comparison value")]
    MissingValue(ConditionOperator),

    #[error("operator '{operator:?}' requires an array value, got {got}")]
    NotAnArray {
        operator: ConditionOperator,
        got: String,
    },

    #[error("invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },
}

/// Stateless condition evaluator.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Evaluate a condition tree against the context.
    pub fn evaluate(condition: &Condition, ctx: &WorkflowContext) -> Result<bool, ConditionError> {
        match condition {
            Condition::Group { logic, conditions } => {
                Self::evaluate_group(*logic, conditions, ctx)
            }
            Condition::Leaf {
                field,
                operator,
                value,
                negate,
            } => {
                let actual = ctx.resolve_path(field);
                let result = Self::evaluate_leaf(*operator, actual.as_ref(), value.as_ref())?;
                Ok(if *negate { !result } else { result })
            }
        }
    }

    /// Short-circuiting and/or. An empty `and` group is true, an empty `or`
    /// group is false.
    fn evaluate_group(
        logic: ConditionLogic,
        conditions: &[Condition],
        ctx: &WorkflowContext,
    ) -> Result<bool, ConditionError> {
        match logic {
            ConditionLogic::And => {
                for child in conditions {
                    if !Self::evaluate(child, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ConditionLogic::Or => {
                for child in conditions {
                    if Self::evaluate(child, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn evaluate_leaf(
        operator: ConditionOperator,
        actual: Option<&Value>,
        expected: Option<&Value>,
    ) -> Result<bool, ConditionError> {
        use ConditionOperator::*;

        // Absent paths have a defined result per operator.
        let Some(actual) = actual else {
            return Ok(match operator {
                Exists => false,
                IsEmpty => true,
                Neq => expected.is_some(),
                NotIn => true,
                _ => false,
            });
        };

        let result = match operator {
            Eq => values_equal(actual, Self::required(operator, expected)?),
            Neq => !values_equal(actual, Self::required(operator, expected)?),
            Gt => compare(actual, Self::required(operator, expected)?)
                .is_some_and(|o| o == std::cmp::Ordering::Greater),
            Gte => compare(actual, Self::required(operator, expected)?)
                .is_some_and(|o| o != std::cmp::Ordering::Less),
            Lt => compare(actual, Self::required(operator, expected)?)
                .is_some_and(|o| o == std::cmp::Ordering::Less),
            Lte => compare(actual, Self::required(operator, expected)?)
                .is_some_and(|o| o != std::cmp::Ordering::Greater),
            In => Self::membership(operator, actual, expected)?,
            NotIn => !Self::membership(operator, actual, expected)?,
            Contains => contains(actual, Self::required(operator, expected)?),
            Matches => {
                let pattern = Self::required(operator, expected)?;
                let Some(pattern) = pattern.as_str() else {
                    return Ok(false);
                };
                let regex = Regex::new(pattern).map_err(|e| ConditionError::InvalidRegex {
                    pattern: pattern.to_string(),
                    message: e.to_string(),
                })?;
                // non-string fields are matched against their JSON rendering
                let haystack = match actual {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                regex.is_match(&haystack)
            }
            Exists => true,
            IsEmpty => is_empty(actual),
            IsTrue => is_truthy(actual),
            IsFalse => !is_truthy(actual),
        };
        Ok(result)
    }

    fn required(
        operator: ConditionOperator,
        expected: Option<&Value>,
    ) -> Result<&Value, ConditionError> {
        expected.ok_or(ConditionError::MissingValue(operator))
    }

    fn membership(
        operator: ConditionOperator,
        actual: &Value,
        expected: Option<&Value>,
    ) -> Result<bool, ConditionError> {
        let expected = Self::required(operator, expected)?;
        let Some(items) = expected.as_array() else {
            return Err(ConditionError::NotAnArray {
                operator,
                got: type_name(expected).to_string(),
            });
        };
        Ok(items.iter().any(|item| values_equal(actual, item)))
    }
}

// ---------------------------------------------------------------------------
// Value semantics
// ---------------------------------------------------------------------------

/// Equality with numeric coercion: `1` and `1.0` are equal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering for numbers and strings; other type pairs do not order.
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

/// String substring or array membership.
fn contains(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|n| map.contains_key(n)),
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Truthiness: false for null, false, zero, and empty containers.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
