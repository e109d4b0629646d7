//! Agent registry implementations.
//!
//! `StaticAgentRegistry` resolves agents from a fixed in-process table, and
//! `FnAgent` adapts a plain closure into the `Agent` trait so embedders can
//! register behavior without a dedicated type per agent.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepflow_core::agent::{Agent, AgentError, AgentInvocation, AgentRegistry};

// ---------------------------------------------------------------------------
// FnAgent
// ---------------------------------------------------------------------------

/// Adapts a synchronous closure into an `Agent`.
pub struct FnAgent<F> {
    id: String,
    func: F,
}

impl<F> FnAgent<F>
where
    F: Fn(Value) -> Result<Value, AgentError> + Send + Sync,
{
    pub fn new(id: impl Into<String>, func: F) -> Self {
        Self {
            id: id.into(),
            func,
        }
    }
}

impl<F> Agent for FnAgent<F>
where
    F: Fn(Value) -> Result<Value, AgentError> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(
        &'a self,
        input: Value,
        _invocation: &'a AgentInvocation,
    ) -> BoxFuture<'a, Result<Value, AgentError>> {
        let result = (self.func)(input);
        Box::pin(async move { result })
    }
}

// ---------------------------------------------------------------------------
// StaticAgentRegistry
// ---------------------------------------------------------------------------

/// Registry over a fixed in-process agent table.
#[derive(Default)]
pub struct StaticAgentRegistry {
    agents: DashMap<String, Arc<dyn Agent>>,
}

impl StaticAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own ID, replacing any previous entry.
    pub fn register(&self, agent: Arc<dyn Agent>) {
        tracing::debug!(agent_id = agent.id(), "registering agent");
        self.agents.insert(agent.id().to_string(), agent);
    }

    /// Register a closure-backed agent.
    pub fn register_fn<F>(&self, id: impl Into<String>, func: F)
    where
        F: Fn(Value) -> Result<Value, AgentError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnAgent::new(id, func)));
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }
}

impl AgentRegistry for StaticAgentRegistry {
    fn resolve<'a>(&'a self, agent_id: &'a str) -> BoxFuture<'a, Result<Arc<dyn Agent>, AgentError>> {
        Box::pin(async move {
            self.agents
                .get(agent_id)
                .map(|entry| Arc::clone(entry.value()))
                .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))
        })
    }
}
