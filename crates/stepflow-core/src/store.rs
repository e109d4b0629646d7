//! Execution store trait definition.
//!
//! Defines the persistence interface for workflow executions. The
//! infrastructure layer (stepflow-infra) implements this trait with an
//! in-memory store; other backends plug in the same way.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use stepflow_types::error::StoreError;
use stepflow_types::execution::{ExecutionStatus, WorkflowExecution};
use uuid::Uuid;

/// Filter for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    /// Maximum number of results, newest first.
    pub limit: Option<usize>,
}

/// Store trait for workflow execution persistence.
pub trait ExecutionStore: Send + Sync {
    /// Upsert an execution record (insert or replace by ID).
    fn save(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Get an execution by ID.
    fn get(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, StoreError>> + Send;

    /// List executions matching a filter, ordered by started_at DESC.
    fn list(
        &self,
        filter: &ExecutionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, StoreError>> + Send;

    /// Delete an execution by ID. Returns `true` if it existed.
    fn delete(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;
}
