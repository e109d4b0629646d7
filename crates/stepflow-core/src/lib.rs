//! Stepflow engine core.
//!
//! Pure engine logic: workflow definitions are loaded and validated
//! ([`definition`]), a [`WorkflowEngine`](engine::WorkflowEngine) drives runs
//! through the transition graph, and a [`StepExecutor`](executor::StepExecutor)
//! dispatches each step kind. Persistence ([`store`]) and agent invocation
//! ([`agent`]) are traits implemented by stepflow-infra.

pub mod agent;
pub mod cancel;
pub mod condition;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod expression;
pub mod retry;
pub mod store;
