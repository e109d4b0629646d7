//! Infrastructure layer for Stepflow.
//!
//! Contains implementations of the traits defined in `stepflow-core`:
//! in-memory execution storage and agent registries.

pub mod agent;
pub mod store;
