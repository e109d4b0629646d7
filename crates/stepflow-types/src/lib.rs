//! Domain types for the Stepflow workflow engine.
//!
//! This crate holds the canonical intermediate representation for workflow
//! definitions (steps, transitions, conditions) and the execution tracking
//! types (`WorkflowExecution`, `StepResult`, lifecycle events). It carries no
//! behavior beyond serde and small accessors; the engine lives in
//! `stepflow-core`.

pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;
