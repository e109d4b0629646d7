//! Execution records: the run-level and step-level state the engine persists
//! through the execution store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow execution.
///
/// `Paused` and `Waiting` are persisted dead-ends: the engine records them but
/// has no resume path, so an execution parked in either stays there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    Paused,
    Waiting,
}

impl ExecutionStatus {
    /// True when no further state change is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::TimedOut
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Waiting => "waiting",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a single step attempt sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Error info
// ---------------------------------------------------------------------------

/// Serializable error snapshot attached to failed steps and executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable code, matched against retry policies.
    pub code: String,
    pub message: String,
    /// Whether the failing layer considered the error transient.
    pub retryable: bool,
    /// Extra structured detail (e.g. threshold values).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
            details: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Step result
// ---------------------------------------------------------------------------

/// Final record of one step's execution, stored in the context under
/// `steps.<id>` and in the execution's step log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    /// Step output, size-capped by the context layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Attempts consumed, including the successful one. Zero for skipped
    /// steps.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StepResult {
    /// Start a running record for a step.
    pub fn started(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Running,
            output: None,
            error: None,
            attempts: 0,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Close the record with a final status, stamping duration.
    pub fn finish(mut self, status: StepStatus) -> Self {
        let now = Utc::now();
        self.duration_ms = Some(
            now.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.finished_at = Some(now);
        self.status = status;
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow execution
// ---------------------------------------------------------------------------

/// A single run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Time-ordered execution ID (UUIDv7).
    pub id: Uuid,
    pub workflow_id: String,
    pub workflow_version: String,
    pub status: ExecutionStatus,
    /// Snapshot of the workflow context at the last persist point.
    pub context: Value,
    /// Final workflow output (the context's `output` section).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Step the run is positioned at; set only while running or parked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// IDs of steps that were executed (completed or failed), in start
    /// order. Append-only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_step_ids: Vec<String>,
    /// Per-step results in completion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_results: Vec<StepResult>,
    /// Lifecycle events observed during the run. Append-only audit log.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<crate::event::WorkflowEvent>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl WorkflowExecution {
    /// Create a new pending execution for a definition.
    pub fn new(workflow_id: impl Into<String>, workflow_version: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            workflow_version: workflow_version.into(),
            status: ExecutionStatus::Pending,
            context: Value::Null,
            output: None,
            error: None,
            current_step_id: None,
            completed_step_ids: Vec::new(),
            step_results: Vec::new(),
            history: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Stamp a terminal (or parked) status and the finish time.
    pub fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.duration_ms = Some(
            now.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.finished_at = Some(now);
        self.status = status;
        self.current_step_id = None;
    }

    /// Number of steps that completed successfully. Skipped steps count
    /// neither as completed nor failed.
    pub fn completed_steps(&self) -> usize {
        self.step_results
            .iter()
            .filter(|r| r.status == StepStatus::Completed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::TimedOut).unwrap(),
            "\"timed_out\""
        );
        let parsed: ExecutionStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, ExecutionStatus::Cancelled);
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
    }

    #[test]
    fn step_result_finish_stamps_duration() {
        let result = StepResult::started("gather").finish(StepStatus::Completed);
        assert_eq!(result.status, StepStatus::Completed);
        assert!(result.finished_at.is_some());
        assert!(result.duration_ms.is_some());
    }

    #[test]
    fn execution_ids_are_time_ordered() {
        let a = WorkflowExecution::new("wf", "1.0");
        let b = WorkflowExecution::new("wf", "1.0");
        assert!(a.id < b.id, "UUIDv7 IDs sort by creation time");
    }

    #[test]
    fn completed_steps_ignores_skipped() {
        let mut execution = WorkflowExecution::new("wf", "1.0");
        execution
            .step_results
            .push(StepResult::started("a").finish(StepStatus::Completed));
        execution
            .step_results
            .push(StepResult::started("b").finish(StepStatus::Skipped));
        execution
            .step_results
            .push(StepResult::started("c").finish(StepStatus::Failed));
        assert_eq!(execution.completed_steps(), 1);
    }
}
