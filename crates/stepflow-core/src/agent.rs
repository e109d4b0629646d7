//! Agent invocation seam.
//!
//! Agent steps delegate to a caller-supplied [`AgentRegistry`]. The engine
//! knows nothing about how agents run; it resolves an ID, hands over the
//! built input, and classifies the outcome. Both traits are object-safe so
//! registries and agents can live behind `Arc<dyn _>`.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::StepError;

/// Failure from agent resolution or execution.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// The registry has no agent under this ID. A definition problem.
    #[error("agent not found: {0}")]
    NotFound(String),

    /// The agent ran and failed.
    #[error("agent failed [{code}]: {message}")]
    Failed {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl AgentError {
    pub fn failed(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        AgentError::Failed {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }
}

impl From<AgentError> for StepError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::NotFound(id) => StepError::Configuration(format!("agent not found: {id}")),
            AgentError::Failed {
                code,
                message,
                retryable,
            } => StepError::Execution {
                code,
                message,
                retryable,
            },
        }
    }
}

/// Metadata passed to an agent alongside its input.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub step_id: String,
}

/// A runnable agent.
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    /// Execute the agent with the built step input.
    fn run<'a>(
        &'a self,
        input: Value,
        invocation: &'a AgentInvocation,
    ) -> BoxFuture<'a, Result<Value, AgentError>>;
}

/// Resolves agent IDs to runnable agents. Resolution is async so registries
/// can lazy-load or construct agents on first use.
pub trait AgentRegistry: Send + Sync {
    fn resolve<'a>(&'a self, agent_id: &'a str)
    -> BoxFuture<'a, Result<Arc<dyn Agent>, AgentError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_configuration_error() {
        let err: StepError = AgentError::NotFound("ghost".to_string()).into();
        assert!(matches!(err, StepError::Configuration(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn failure_preserves_code_and_retryable() {
        let err: StepError = AgentError::failed("rate_limited", "slow down", true).into();
        assert_eq!(err.code(), "rate_limited");
        assert!(err.is_retryable());
    }
}
