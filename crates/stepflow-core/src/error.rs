//! Step-level error taxonomy.
//!
//! Every step failure is classified into one of a small set of variants so
//! that retry policy, status mapping, and persisted `ErrorInfo` all derive
//! from the same source.

use serde_json::Value;
use stepflow_types::execution::ErrorInfo;
use thiserror::Error;

use crate::cancel::CancelReason;

/// A step execution failure.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// The definition asked for something impossible (missing agent, bad
    /// path, malformed spec). Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A runtime failure while executing the step. `retryable` reflects what
    /// the failing layer reported and feeds the retry policy.
    #[error("execution error [{code}]: {message}")]
    Execution {
        code: String,
        message: String,
        retryable: bool,
    },

    /// The run was cancelled while the step was in flight.
    #[error("cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    /// A quality gate metric fell below its threshold. Never retried.
    #[error("threshold not met for '{metric}': {actual} < {expected}")]
    Threshold {
        metric: String,
        expected: f64,
        actual: f64,
    },

    /// The step kind (or mode) is declared but not implemented.
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl StepError {
    /// Shorthand for a non-retryable execution error.
    pub fn execution(code: impl Into<String>, message: impl Into<String>) -> Self {
        StepError::Execution {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Shorthand for a retryable execution error.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        StepError::Execution {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Machine-readable code, matched against `retry_on` / `no_retry_on`.
    pub fn code(&self) -> &str {
        match self {
            StepError::Configuration(_) => "configuration",
            StepError::Execution { code, .. } => code,
            StepError::Cancelled { .. } => "cancelled",
            StepError::Threshold { .. } => "threshold",
            StepError::NotSupported(_) => "not_supported",
        }
    }

    /// Whether the error is eligible for retry at all. Code lists in the
    /// step's `RetryConfig` can narrow this further, never widen it.
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Execution { retryable, .. } => *retryable,
            StepError::Configuration(_)
            | StepError::Cancelled { .. }
            | StepError::Threshold { .. }
            | StepError::NotSupported(_) => false,
        }
    }

    /// True when the failure is a cancellation, which must propagate without
    /// retries and map to the cancelled status.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StepError::Cancelled { .. })
    }

    /// Persistable snapshot of this error.
    pub fn to_error_info(&self) -> ErrorInfo {
        let mut info = ErrorInfo::new(self.code(), self.to_string(), self.is_retryable());
        if let StepError::Threshold {
            metric,
            expected,
            actual,
        } = self
        {
            info.details = Some(serde_json::json!({
                "metric": metric,
                "expected": expected,
                "actual": actual,
            }));
        }
        info
    }
}

/// Output of a successful step attempt.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub value: Value,
    /// True when the step was skipped (when-condition false, or conditional
    /// with no matching branch).
    pub skipped: bool,
    /// True when the step parked the run (manual/review gate). The engine
    /// records the result and leaves the execution in a waiting status.
    pub waiting: bool,
}

impl StepOutput {
    pub fn value(value: Value) -> Self {
        Self {
            value,
            skipped: false,
            waiting: false,
        }
    }

    pub fn skipped() -> Self {
        Self {
            value: Value::Null,
            skipped: true,
            waiting: false,
        }
    }

    pub fn waiting(value: Value) -> Self {
        Self {
            value,
            skipped: false,
            waiting: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_never_retryable() {
        let err = StepError::Configuration("unknown agent".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "configuration");
    }

    #[test]
    fn execution_error_carries_code_and_flag() {
        let err = StepError::transient("http_503", "upstream unavailable");
        assert!(err.is_retryable());
        assert_eq!(err.code(), "http_503");

        let err = StepError::execution("bad_input", "missing field");
        assert!(!err.is_retryable());
    }

    #[test]
    fn threshold_details_serialized() {
        let err = StepError::Threshold {
            metric: "variables.score".to_string(),
            expected: 0.8,
            actual: 0.5,
        };
        let info = err.to_error_info();
        assert_eq!(info.code, "threshold");
        assert!(!info.retryable);
        let details = info.details.unwrap();
        assert_eq!(details["expected"], 0.8);
        assert_eq!(details["actual"], 0.5);
    }

    #[test]
    fn cancellation_detected() {
        let err = StepError::Cancelled {
            reason: CancelReason::Manual,
        };
        assert!(err.is_cancellation());
        assert!(!err.is_retryable());
    }
}
