//! Lifecycle events emitted by the engine. Consumed best-effort (UI, audit
//! trails); never load-bearing for execution semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{ExecutionStatus, StepStatus};

/// An engine lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: WorkflowEventKind,
}

impl WorkflowEvent {
    pub fn new(execution_id: Uuid, workflow_id: impl Into<String>, kind: WorkflowEventKind) -> Self {
        Self {
            execution_id,
            workflow_id: workflow_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Event payloads, tagged by `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEventKind {
    ExecutionStarted,
    ExecutionFinished {
        status: ExecutionStatus,
    },
    StepStarted {
        step_id: String,
    },
    StepFinished {
        step_id: String,
        status: StepStatus,
    },
    StepRetrying {
        step_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    CancellationRequested {
        reason: String,
    },
}
