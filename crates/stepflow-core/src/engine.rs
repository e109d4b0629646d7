//! Workflow engine: drives a definition through the transition graph.
//!
//! `WorkflowEngine::execute` owns the run lifecycle: validate, build the
//! context, walk steps along transitions, and persist the final
//! `WorkflowExecution`. A run that starts always yields `Ok` with a terminal
//! (or parked) status; `Err` means the run was rejected before any step ran
//! or the store failed.
//!
//! Cancellation is cooperative: a watchdog task fires the run's cancel token
//! with a timeout reason when the workflow deadline elapses, and callers can
//! cancel live runs by execution ID.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stepflow_types::error::StoreError;
use stepflow_types::event::{WorkflowEvent, WorkflowEventKind};
use stepflow_types::execution::{ExecutionStatus, StepStatus, WorkflowExecution};
use stepflow_types::workflow::WorkflowDefinition;
use thiserror::Error;
use uuid::Uuid;

use crate::agent::AgentRegistry;
use crate::cancel::{CancelReason, CancelRegistry, CancelToken};
use crate::condition::ConditionEvaluator;
use crate::context::{SystemInfo, WorkflowContext};
use crate::definition::{DefinitionError, validate_definition};
use crate::error::StepError;
use crate::event::EventBus;
use crate::executor::{ExecutorConfig, StepExecutor};
use crate::store::{ExecutionFilter, ExecutionStore};

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Workflow deadline when the definition carries no `timeout_ms`.
    pub default_timeout_ms: u64,
    /// Hard cap on transitions taken in one run, against definition cycles.
    pub max_transitions: usize,
    /// Event bus channel capacity.
    pub event_capacity: usize,
    /// Admission limit on concurrently live runs.
    pub max_concurrent_executions: usize,
    /// Persist execution snapshots to the store at run start, after each
    /// step, and at settle.
    pub persist_state: bool,
    pub executor: ExecutorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 300_000,
            max_transitions: 1_000,
            event_capacity: 1024,
            max_concurrent_executions: 100,
            persist_state: true,
            executor: ExecutorConfig::default(),
        }
    }
}

/// Errors that reject a run before it starts, or surface from the store.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("at capacity: {active} of {max} executions running")]
    Capacity { active: usize, max: usize },
}

/// Per-run options.
#[derive(Debug, Default)]
pub struct ExecuteOptions {
    /// Caller-supplied workflow input.
    pub input: Value,
    /// Pre-created cancel token, for callers that want a cancellation handle
    /// before the run starts.
    pub cancel: Option<CancelToken>,
}

impl ExecuteOptions {
    pub fn with_input(input: Value) -> Self {
        Self {
            input,
            cancel: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives workflow definitions to completion.
pub struct WorkflowEngine<S: ExecutionStore> {
    store: Arc<S>,
    executor: StepExecutor,
    events: EventBus,
    cancels: CancelRegistry,
    config: EngineConfig,
}

impl<S: ExecutionStore> WorkflowEngine<S> {
    pub fn new(store: Arc<S>, registry: Arc<dyn AgentRegistry>, config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let executor = StepExecutor::new(registry, events.clone(), config.executor.clone());
        Self {
            store,
            executor,
            events,
            cancels: CancelRegistry::new(),
            config,
        }
    }

    /// Subscribe to lifecycle events for all runs on this engine.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Request cancellation of a live run. Returns false when the run is
    /// unknown or already settled.
    pub fn cancel(&self, execution_id: &Uuid) -> bool {
        self.cancels.cancel(execution_id, CancelReason::Manual)
    }

    /// Fetch a persisted execution.
    pub async fn get_execution(&self, execution_id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        self.store
            .get(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(*execution_id))
    }

    /// List persisted executions.
    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self.store.list(filter).await?)
    }

    /// Run a workflow definition to a settled execution.
    ///
    /// Returns `Ok` for completed, failed, cancelled, timed-out, and parked
    /// runs alike; the outcome is in `WorkflowExecution::status`.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        options: ExecuteOptions,
    ) -> Result<WorkflowExecution, EngineError> {
        validate_definition(definition)?;

        let mut execution = WorkflowExecution::new(&definition.id, &definition.version);
        execution.status = ExecutionStatus::Running;
        let system = SystemInfo {
            execution_id: execution.id,
            workflow_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            workflow_version: definition.version.clone(),
            started_at: execution.started_at,
        };
        let mut ctx = WorkflowContext::new(system, options.input);

        let token = options.cancel.unwrap_or_default();
        if let Err(active) = self.cancels.try_register(
            execution.id,
            token.clone(),
            self.config.max_concurrent_executions,
        ) {
            return Err(EngineError::Capacity {
                active,
                max: self.config.max_concurrent_executions,
            });
        }
        if self.config.persist_state {
            // release the admission slot if the initial save fails
            if let Err(err) = self.store.save(&execution).await {
                self.cancels.remove(&execution.id);
                return Err(err.into());
            }
        }

        // collects this run's events into the execution's audit log
        let mut history_rx = self.events.subscribe();

        self.events.publish(WorkflowEvent::new(
            execution.id,
            definition.id.clone(),
            WorkflowEventKind::ExecutionStarted,
        ));
        tracing::info!(
            execution_id = %execution.id,
            workflow = definition.id.as_str(),
            "starting workflow execution"
        );

        // Deadline watchdog: fires the shared token with a timeout reason.
        let timeout_ms = definition
            .timeout_ms
            .unwrap_or(self.config.default_timeout_ms);
        let deadline_token = token.clone();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            deadline_token.cancel(CancelReason::Timeout);
        });

        let driven = self.drive(definition, &mut execution, &mut ctx, &token).await;

        watchdog.abort();
        self.cancels.remove(&execution.id);
        let (status, error) = driven?;

        if matches!(
            status,
            ExecutionStatus::Cancelled | ExecutionStatus::TimedOut
        ) {
            self.events.publish(WorkflowEvent::new(
                execution.id,
                definition.id.clone(),
                WorkflowEventKind::CancellationRequested {
                    reason: token.reason_or_manual().to_string(),
                },
            ));
        }

        snapshot_progress(&mut execution, &ctx);
        execution.output = Some(ctx.output_value());
        execution.error = error;

        if status.is_terminal() {
            execution.finish(status);
        } else {
            // parked runs (waiting) keep their slot open at the parked step
            execution.status = status;
            execution.current_step_id = execution.step_results.last().map(|r| r.step_id.clone());
        }

        // publish before draining so the terminal event lands in the log
        self.events.publish(WorkflowEvent::new(
            execution.id,
            definition.id.clone(),
            WorkflowEventKind::ExecutionFinished { status },
        ));
        loop {
            match history_rx.try_recv() {
                Ok(event) => {
                    if event.execution_id == execution.id {
                        execution.history.push(event);
                    }
                }
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }

        if self.config.persist_state {
            self.store.save(&execution).await?;
        }
        tracing::info!(
            execution_id = %execution.id,
            workflow = definition.id.as_str(),
            status = %status,
            steps = execution.step_results.len(),
            "workflow execution settled"
        );

        Ok(execution)
    }

    /// Walk the transition graph until the run settles, persisting a
    /// checkpoint after each step so a crash loses at most the step in
    /// flight.
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        execution: &mut WorkflowExecution,
        ctx: &mut WorkflowContext,
        token: &CancelToken,
    ) -> Result<
        (ExecutionStatus, Option<stepflow_types::execution::ErrorInfo>),
        EngineError,
    > {
        let mut current = Some(definition.entry_step_id.clone());
        let mut transitions_taken = 0usize;

        while let Some(step_id) = current {
            if token.is_cancelled() {
                return Ok((cancel_status(token), None));
            }

            // validated at load time; a miss here is a definition bug
            let Some(step) = definition.step(&step_id) else {
                let err = StepError::Configuration(format!("unknown step '{step_id}'"));
                return Ok((ExecutionStatus::Failed, Some(err.to_error_info())));
            };

            let settled = self.executor.execute(step, ctx, token).await;
            self.checkpoint(execution, ctx, &step_id).await?;

            match settled {
                Ok(output) if output.waiting => {
                    tracing::info!(step_id = step_id.as_str(), "run parked by gate");
                    return Ok((ExecutionStatus::Waiting, None));
                }
                Ok(_) => {}
                Err(err) if err.is_cancellation() => {
                    return Ok((cancel_status(token), Some(err.to_error_info())));
                }
                Err(err) => {
                    return Ok((ExecutionStatus::Failed, Some(err.to_error_info())));
                }
            }

            transitions_taken += 1;
            if transitions_taken > self.config.max_transitions {
                let err = StepError::execution(
                    "transition_limit",
                    format!(
                        "run exceeded {} transitions; the definition likely cycles",
                        self.config.max_transitions
                    ),
                );
                return Ok((ExecutionStatus::Failed, Some(err.to_error_info())));
            }

            current = match select_next(definition, &step_id, ctx) {
                Ok(next) => next,
                Err(err) => return Ok((ExecutionStatus::Failed, Some(err.to_error_info()))),
            };
        }

        Ok((ExecutionStatus::Completed, None))
    }

    /// Persist the run's progress after a step settles.
    async fn checkpoint(
        &self,
        execution: &mut WorkflowExecution,
        ctx: &WorkflowContext,
        step_id: &str,
    ) -> Result<(), EngineError> {
        if !self.config.persist_state {
            return Ok(());
        }
        snapshot_progress(execution, ctx);
        execution.current_step_id = Some(step_id.to_string());
        self.store.save(execution).await?;
        Ok(())
    }
}

/// Copy the context's accumulated step results onto the execution record.
fn snapshot_progress(execution: &mut WorkflowExecution, ctx: &WorkflowContext) {
    execution.context = ctx.to_json();
    let mut results: Vec<_> = ctx.step_results.values().cloned().collect();
    results.sort_by_key(|r| r.started_at);
    execution.completed_step_ids = results
        .iter()
        .filter(|r| matches!(r.status, StepStatus::Completed | StepStatus::Failed))
        .map(|r| r.step_id.clone())
        .collect();
    execution.step_results = results;
}

fn cancel_status(token: &CancelToken) -> ExecutionStatus {
    match token.reason_or_manual() {
        CancelReason::Timeout => ExecutionStatus::TimedOut,
        CancelReason::Manual => ExecutionStatus::Cancelled,
    }
}

/// Pick the next step after `current`.
///
/// With no transitions in the definition, steps run in declaration order.
/// Otherwise non-default transitions from `current` are tried in descending
/// priority; the default edge is the fallback; no match ends the run.
fn select_next(
    definition: &WorkflowDefinition,
    current: &str,
    ctx: &WorkflowContext,
) -> Result<Option<String>, StepError> {
    if definition.transitions.is_empty() {
        let next = definition
            .step_index(current)
            .and_then(|idx| definition.steps.get(idx + 1))
            .map(|s| s.id.clone());
        return Ok(next);
    }

    let mut candidates: Vec<_> = definition
        .transitions
        .iter()
        .filter(|t| t.from == current && !t.is_default)
        .collect();
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

    for transition in candidates {
        let pass = match &transition.condition {
            None => true,
            Some(condition) => ConditionEvaluator::evaluate(condition, ctx)
                .map_err(|e| StepError::Configuration(e.to_string()))?,
        };
        if pass {
            return Ok(Some(transition.to.clone()));
        }
    }

    Ok(definition
        .transitions
        .iter()
        .find(|t| t.from == current && t.is_default)
        .map(|t| t.to.clone()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
