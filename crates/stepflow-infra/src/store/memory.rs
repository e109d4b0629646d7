//! In-memory execution store.
//!
//! Implements `ExecutionStore` from `stepflow-core` over a `DashMap`. Records
//! are deep-cloned on both save and read so callers never share mutable state
//! with the store. Suited to embedded use and tests; persistence across
//! restarts needs a different backend behind the same trait.

use dashmap::DashMap;
use stepflow_core::store::{ExecutionFilter, ExecutionStore};
use stepflow_types::error::StoreError;
use stepflow_types::execution::WorkflowExecution;
use uuid::Uuid;

/// DashMap-backed implementation of `ExecutionStore`.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    executions: DashMap<Uuid, WorkflowExecution>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions.
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

impl ExecutionStore for MemoryExecutionStore {
    async fn save(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        tracing::debug!(
            execution_id = %execution.id,
            status = %execution.status,
            "saving execution"
        );
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get(&self, execution_id: &Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.executions.get(execution_id).map(|e| e.clone()))
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut matched: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|entry| {
                filter
                    .workflow_id
                    .as_ref()
                    .is_none_or(|id| &entry.workflow_id == id)
                    && filter.status.is_none_or(|status| entry.status == status)
            })
            .map(|entry| entry.clone())
            .collect();

        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn delete(&self, execution_id: &Uuid) -> Result<bool, StoreError> {
        Ok(self.executions.remove(execution_id).is_some())
    }
}
