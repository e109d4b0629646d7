//! Step executor: dispatches each step kind and owns the per-step lifecycle.
//!
//! `StepExecutor::execute` is the single entry point for running a step. It
//! evaluates the skip condition, builds the step input, drives the retry
//! loop, and records the settled `StepResult` into the context. Composite
//! kinds (sequential, parallel, conditional, loop) recurse through the same
//! entry point, so every step in the tree gets the same treatment.
//!
//! Parallel children run on a `tokio::JoinSet`, each against a cloned
//! snapshot of the context; their step results merge back at the join point.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use stepflow_types::event::{WorkflowEvent, WorkflowEventKind};
use stepflow_types::execution::{StepResult, StepStatus};
use stepflow_types::workflow::{
    DataMapping, FailureStrategy, GateKind, RetryConfig, StepKind, TransformEngine, WaitMode,
    WorkflowStep,
};
use tokio::task::JoinSet;

use crate::agent::{AgentError, AgentInvocation, AgentRegistry};
use crate::cancel::CancelToken;
use crate::condition::ConditionEvaluator;
use crate::context::WorkflowContext;
use crate::error::{StepError, StepOutput};
use crate::event::EventBus;
use crate::expression::ExpressionEvaluator;
use crate::retry::RetryPolicy;

/// Default chunk size for parallel steps without an explicit
/// `max_concurrency`.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub default_max_concurrency: usize,
    /// Retry policy applied to steps that declare none.
    pub default_retry: Option<RetryConfig>,
    /// Log step dispatch at info instead of debug.
    pub verbose_logging: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: DEFAULT_MAX_CONCURRENCY,
            default_retry: None,
            verbose_logging: false,
        }
    }
}

/// Executes workflow steps against a context.
///
/// Cheap to clone: the registry is shared behind `Arc` and clones share the
/// event channel. Parallel children run on clones.
#[derive(Clone)]
pub struct StepExecutor {
    registry: Arc<dyn AgentRegistry>,
    events: EventBus,
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(registry: Arc<dyn AgentRegistry>, events: EventBus, config: ExecutorConfig) -> Self {
        Self {
            registry,
            events,
            config,
        }
    }

    /// Run one step to a settled result.
    ///
    /// Handles the skip condition, the retry loop, cancellation, result
    /// recording, and output mappings. Boxed so composite kinds can recurse
    /// and parallel children can be spawned.
    pub fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a mut WorkflowContext,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<StepOutput, StepError>> {
        Box::pin(async move {
            cancel.error_if_cancelled()?;

            // Skip condition: false means the step settles as skipped.
            if let Some(when) = &step.when {
                let pass = ConditionEvaluator::evaluate(when, ctx)
                    .map_err(|e| StepError::Configuration(e.to_string()))?;
                if !pass {
                    tracing::debug!(step_id = step.id.as_str(), "skip condition false");
                    let mut result = StepResult::started(step.id.clone()).finish(StepStatus::Skipped);
                    result.attempts = 0;
                    self.record(ctx, result)?;
                    self.publish(ctx, WorkflowEventKind::StepFinished {
                        step_id: step.id.clone(),
                        status: StepStatus::Skipped,
                    });
                    return Ok(StepOutput::skipped());
                }
            }

            self.publish(ctx, WorkflowEventKind::StepStarted {
                step_id: step.id.clone(),
            });
            if self.config.verbose_logging {
                tracing::info!(
                    step_id = step.id.as_str(),
                    kind = step.kind.name(),
                    "executing step"
                );
            } else {
                tracing::debug!(
                    step_id = step.id.as_str(),
                    kind = step.kind.name(),
                    "executing step"
                );
            }

            let record = StepResult::started(step.id.clone());
            let retry = step
                .retry
                .clone()
                .or_else(|| self.config.default_retry.clone())
                .unwrap_or_default();
            let mut attempt: u32 = 1;

            loop {
                match self.dispatch(step, ctx, cancel).await {
                    Ok(output) => {
                        if !output.skipped {
                            self.apply_output_mappings(step, &output.value, ctx)?;
                        }
                        let mut result = record.clone().finish(if output.skipped {
                            StepStatus::Skipped
                        } else {
                            StepStatus::Completed
                        });
                        result.attempts = if output.skipped { 0 } else { attempt };
                        result.output = (!output.skipped).then(|| output.value.clone());
                        self.record(ctx, result)?;
                        self.publish(ctx, WorkflowEventKind::StepFinished {
                            step_id: step.id.clone(),
                            status: if output.skipped {
                                StepStatus::Skipped
                            } else {
                                StepStatus::Completed
                            },
                        });
                        return Ok(output);
                    }
                    Err(err) if err.is_cancellation() => {
                        let mut result = record.finish(StepStatus::Cancelled);
                        result.attempts = attempt;
                        result.error = Some(err.to_error_info());
                        self.record(ctx, result)?;
                        self.publish(ctx, WorkflowEventKind::StepFinished {
                            step_id: step.id.clone(),
                            status: StepStatus::Cancelled,
                        });
                        return Err(err);
                    }
                    Err(err) => {
                        if RetryPolicy::should_retry(&retry, &err, attempt) {
                            let delay = RetryPolicy::delay_after(&retry, attempt);
                            tracing::warn!(
                                step_id = step.id.as_str(),
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "step failed, retrying"
                            );
                            self.publish(ctx, WorkflowEventKind::StepRetrying {
                                step_id: step.id.clone(),
                                attempt,
                                delay_ms: delay.as_millis() as u64,
                            });
                            self.sleep(delay, cancel).await?;
                            attempt += 1;
                            continue;
                        }

                        tracing::warn!(
                            step_id = step.id.as_str(),
                            attempt,
                            error = %err,
                            "step failed"
                        );
                        let mut result = record.finish(StepStatus::Failed);
                        result.attempts = attempt;
                        result.error = Some(err.to_error_info());
                        self.record(ctx, result)?;
                        self.publish(ctx, WorkflowEventKind::StepFinished {
                            step_id: step.id.clone(),
                            status: StepStatus::Failed,
                        });
                        return Err(err);
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch(
        &self,
        step: &WorkflowStep,
        ctx: &mut WorkflowContext,
        cancel: &CancelToken,
    ) -> Result<StepOutput, StepError> {
        match &step.kind {
            StepKind::Agent { agent_id, input } => {
                self.run_agent(step, agent_id, input.as_ref(), ctx, cancel).await
            }
            StepKind::Sequential {
                steps,
                stop_on_error,
            } => self.run_sequential(steps, *stop_on_error, ctx, cancel).await,
            StepKind::Parallel {
                steps,
                max_concurrency,
                failure_strategy,
                min_successful,
            } => {
                self.run_parallel(
                    steps,
                    max_concurrency.unwrap_or(self.config.default_max_concurrency),
                    *failure_strategy,
                    *min_successful,
                    ctx,
                    cancel,
                )
                .await
            }
            StepKind::Conditional {
                condition,
                then_step,
                else_step,
            } => {
                let matched = ConditionEvaluator::evaluate(condition, ctx)
                    .map_err(|e| StepError::Configuration(e.to_string()))?;
                if matched {
                    self.execute(then_step, ctx, cancel).await
                } else if let Some(else_step) = else_step {
                    self.execute(else_step, ctx, cancel).await
                } else {
                    Ok(StepOutput::skipped())
                }
            }
            StepKind::Loop { .. } => self.run_loop(step, ctx, cancel).await,
            StepKind::Transform {
                input_variable,
                engine,
                spec,
                output_variable,
            } => {
                self.run_transform(input_variable.as_deref(), *engine, spec, output_variable, ctx)
            }
            StepKind::Wait { mode } => self.run_wait(mode, cancel).await,
            StepKind::Gate { gate } => self.run_gate(gate, ctx),
            StepKind::Subworkflow { workflow_id, .. } => Err(StepError::NotSupported(format!(
                "subworkflow steps are not implemented (workflow '{workflow_id}')"
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Agent
    // -----------------------------------------------------------------------

    async fn run_agent(
        &self,
        step: &WorkflowStep,
        agent_id: &str,
        static_input: Option<&Value>,
        ctx: &WorkflowContext,
        cancel: &CancelToken,
    ) -> Result<StepOutput, StepError> {
        let input = self.build_input(step, static_input, ctx)?;

        // Unresolved agents degrade to a placeholder output instead of
        // failing, so definitions can be authored before agents exist.
        let agent = match self.registry.resolve(agent_id).await {
            Ok(agent) => agent,
            Err(AgentError::NotFound(_)) => {
                tracing::warn!(
                    step_id = step.id.as_str(),
                    agent_id,
                    "agent not registered, returning placeholder output"
                );
                return Ok(StepOutput::value(json!({
                    "agent_id": agent_id,
                    "status": "not_registered",
                    "message": format!("agent '{agent_id}' is not registered"),
                })));
            }
            Err(err) => return Err(err.into()),
        };

        let invocation = AgentInvocation {
            execution_id: ctx.system.execution_id,
            workflow_id: ctx.system.workflow_id.clone(),
            step_id: step.id.clone(),
        };

        tokio::select! {
            result = agent.run(input, &invocation) => {
                let value = result?;
                Ok(StepOutput::value(value))
            }
            _ = cancel.cancelled() => Err(StepError::Cancelled {
                reason: cancel.reason_or_manual(),
            }),
        }
    }

    /// Build an agent step's input: static input with templates resolved,
    /// then input mappings layered on top.
    fn build_input(
        &self,
        step: &WorkflowStep,
        static_input: Option<&Value>,
        ctx: &WorkflowContext,
    ) -> Result<Value, StepError> {
        let mut input = match static_input {
            Some(value) => ctx.resolve_templates_in(value),
            None => json!({}),
        };

        for mapping in &step.input_mappings {
            let resolved = self.resolve_mapping_source(mapping, ctx)?;
            if let Some(value) = resolved {
                set_path(&mut input, &mapping.target, value);
            }
        }
        Ok(input)
    }

    fn resolve_mapping_source(
        &self,
        mapping: &DataMapping,
        ctx: &WorkflowContext,
    ) -> Result<Option<Value>, StepError> {
        match ctx.resolve_path(&mapping.source) {
            Some(value) => Ok(Some(value)),
            None => match &mapping.default {
                Some(default) => Ok(Some(default.clone())),
                None if mapping.required => Err(StepError::Configuration(format!(
                    "required mapping source '{}' is absent",
                    mapping.source
                ))),
                None => Ok(None),
            },
        }
    }

    /// Copy fields of a settled step's output into the workflow output.
    fn apply_output_mappings(
        &self,
        step: &WorkflowStep,
        output: &Value,
        ctx: &mut WorkflowContext,
    ) -> Result<(), StepError> {
        for mapping in &step.output_mappings {
            // reserved prefixes read from the context, bare paths from the
            // step output itself
            let resolved = if has_reserved_prefix(&mapping.source) {
                ctx.resolve_path(&mapping.source)
            } else {
                navigate_path(output, &mapping.source)
            };
            let value = match resolved {
                Some(value) => value,
                None => match &mapping.default {
                    Some(default) => default.clone(),
                    None if mapping.required => {
                        return Err(StepError::Configuration(format!(
                            "required output mapping source '{}' is absent",
                            mapping.source
                        )));
                    }
                    None => continue,
                },
            };
            ctx.set_output(&mapping.target, value);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sequential
    // -----------------------------------------------------------------------

    async fn run_sequential(
        &self,
        steps: &[WorkflowStep],
        stop_on_error: bool,
        ctx: &mut WorkflowContext,
        cancel: &CancelToken,
    ) -> Result<StepOutput, StepError> {
        let mut completed = 0usize;
        let mut failed: Vec<Value> = Vec::new();

        for child in steps {
            match self.execute(child, &mut *ctx, cancel).await {
                Ok(output) => {
                    if !output.skipped {
                        completed += 1;
                    }
                    if output.waiting {
                        return Ok(output);
                    }
                }
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    if stop_on_error {
                        return Err(err);
                    }
                    failed.push(json!({
                        "step_id": child.id,
                        "error": err.to_error_info(),
                    }));
                }
            }
        }

        Ok(StepOutput::value(json!({
            "completed": completed,
            "failed": failed,
        })))
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    async fn run_parallel(
        &self,
        steps: &[WorkflowStep],
        max_concurrency: usize,
        failure_strategy: FailureStrategy,
        min_successful: Option<usize>,
        ctx: &mut WorkflowContext,
        cancel: &CancelToken,
    ) -> Result<StepOutput, StepError> {
        let chunk_size = max_concurrency.max(1);
        let mut completed = 0usize;
        let mut skipped = 0usize;
        let mut failed: Vec<Value> = Vec::new();

        for chunk in steps.chunks(chunk_size) {
            cancel.error_if_cancelled()?;

            let mut join_set = JoinSet::new();
            for child in chunk {
                let executor = self.clone();
                let child = child.clone();
                let mut snapshot = ctx.clone();
                let token = cancel.clone();

                join_set.spawn(async move {
                    let result = executor.execute(&child, &mut snapshot, &token).await;
                    (child.id.clone(), result, snapshot)
                });
            }

            let mut chunk_error: Option<StepError> = None;
            while let Some(joined) = join_set.join_next().await {
                // a panicking child counts as a failed child, not a failed step
                let (child_id, result, snapshot) = match joined {
                    Ok(settled) => settled,
                    Err(join_err) => {
                        let err =
                            StepError::execution("join", format!("task join error: {join_err}"));
                        match failure_strategy {
                            FailureStrategy::FailFast => {
                                join_set.abort_all();
                                chunk_error = Some(err);
                                break;
                            }
                            FailureStrategy::CollectAll => {
                                failed.push(json!({
                                    "step_id": null,
                                    "error": err.to_error_info(),
                                }));
                                continue;
                            }
                        }
                    }
                };

                // child results become visible to later chunks either way
                ctx.merge_step_results(snapshot);

                match result {
                    Ok(output) if output.skipped => skipped += 1,
                    Ok(_) => completed += 1,
                    Err(err) if err.is_cancellation() => {
                        join_set.abort_all();
                        return Err(err);
                    }
                    Err(err) => match failure_strategy {
                        FailureStrategy::FailFast => {
                            join_set.abort_all();
                            chunk_error = Some(err);
                            break;
                        }
                        FailureStrategy::CollectAll => {
                            failed.push(json!({
                                "step_id": child_id,
                                "error": err.to_error_info(),
                            }));
                        }
                    },
                }
            }

            if let Some(err) = chunk_error {
                return Err(err);
            }
        }

        if let Some(min) = min_successful {
            if completed < min {
                return Err(StepError::Threshold {
                    metric: "min_successful".to_string(),
                    expected: min as f64,
                    actual: completed as f64,
                });
            }
        }

        Ok(StepOutput::value(json!({
            "completed": completed,
            "skipped": skipped,
            "failed": failed,
        })))
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    async fn run_loop(
        &self,
        step: &WorkflowStep,
        ctx: &mut WorkflowContext,
        cancel: &CancelToken,
    ) -> Result<StepOutput, StepError> {
        let StepKind::Loop {
            collection,
            item_variable,
            index_variable,
            while_condition,
            until_condition,
            max_iterations,
            iteration_delay_ms,
            body,
        } = &step.kind
        else {
            return Err(StepError::Configuration("not a loop step".to_string()));
        };

        let items: Option<Vec<Value>> = match collection {
            Some(path) => {
                let value = ctx.resolve_path(path).unwrap_or(Value::Null);
                match value {
                    Value::Array(items) => Some(items),
                    other => {
                        return Err(StepError::execution(
                            "loop_collection",
                            format!(
                                "loop collection '{path}' is not an array (got {})",
                                json_type(&other)
                            ),
                        ));
                    }
                }
            }
            None => None,
        };

        let item_name = item_variable.as_deref().unwrap_or("item");
        let index_name = index_variable.as_deref().unwrap_or("index");
        let cap = *max_iterations as usize;

        let mut results: Vec<Value> = Vec::new();
        let mut iteration = 0usize;

        loop {
            cancel.error_if_cancelled()?;
            if iteration >= cap {
                break;
            }

            // bind loop variables before guards and body
            match &items {
                Some(items) => {
                    let Some(item) = items.get(iteration) else {
                        break;
                    };
                    ctx.set_variable(item_name, item.clone());
                }
                None => {}
            }
            ctx.set_variable(index_name, json!(iteration));

            if let Some(guard) = while_condition {
                let keep_going = ConditionEvaluator::evaluate(guard, ctx)
                    .map_err(|e| StepError::Configuration(e.to_string()))?;
                if !keep_going {
                    break;
                }
            }

            let output = self.execute(body, &mut *ctx, cancel).await?;
            if output.waiting {
                return Ok(output);
            }
            results.push(output.value);
            iteration += 1;

            if let Some(guard) = until_condition {
                let done = ConditionEvaluator::evaluate(guard, ctx)
                    .map_err(|e| StepError::Configuration(e.to_string()))?;
                if done {
                    break;
                }
            }

            if let Some(delay_ms) = iteration_delay_ms {
                self.sleep(Duration::from_millis(*delay_ms), cancel).await?;
            }
        }

        Ok(StepOutput::value(json!({
            "iterations": iteration,
            "results": results,
        })))
    }

    // -----------------------------------------------------------------------
    // Transform
    // -----------------------------------------------------------------------

    fn run_transform(
        &self,
        input_variable: Option<&str>,
        engine: TransformEngine,
        spec: &str,
        output_variable: &str,
        ctx: &mut WorkflowContext,
    ) -> Result<StepOutput, StepError> {
        let input = match input_variable {
            Some(path) => ctx.resolve_path(path).unwrap_or(Value::Null),
            None => ctx.input.clone(),
        };

        let transformed = match engine {
            TransformEngine::Template => ctx.resolve_templates_in(&Value::String(spec.to_string())),
            // the evaluator holds non-Send transform closures, so build it
            // at the use site instead of storing it across awaits
            TransformEngine::Expression => ExpressionEvaluator::new()
                .evaluate_transform(spec, &input, ctx)
                .map_err(|e| StepError::execution("expression", e.to_string()))?,
            // pass-through stubs: the input is forwarded unchanged so
            // definitions using these engines still run end to end
            TransformEngine::Jsonpath | TransformEngine::Jmespath => {
                tracing::warn!(
                    engine = ?engine,
                    spec,
                    "transform engine not implemented, forwarding input unchanged"
                );
                input.clone()
            }
        };

        if let Some(rest) = output_variable.strip_prefix("output.") {
            ctx.set_output(rest, transformed.clone());
        } else {
            let name = output_variable
                .strip_prefix("variables.")
                .unwrap_or(output_variable);
            ctx.set_variable(name, transformed.clone());
        }

        Ok(StepOutput::value(transformed))
    }

    // -----------------------------------------------------------------------
    // Wait and gates
    // -----------------------------------------------------------------------

    async fn run_wait(&self, mode: &WaitMode, cancel: &CancelToken) -> Result<StepOutput, StepError> {
        match mode {
            WaitMode::Duration { duration_ms } => {
                self.sleep(Duration::from_millis(*duration_ms), cancel).await?;
                Ok(StepOutput::value(json!({ "waited_ms": duration_ms })))
            }
            WaitMode::Event { .. } => Err(StepError::NotSupported(
                "event waits are not implemented".to_string(),
            )),
            WaitMode::Schedule { .. } => Err(StepError::NotSupported(
                "scheduled waits are not implemented".to_string(),
            )),
            WaitMode::Approval { .. } => Err(StepError::NotSupported(
                "approval waits are not implemented".to_string(),
            )),
        }
    }

    fn run_gate(&self, gate: &GateKind, ctx: &WorkflowContext) -> Result<StepOutput, StepError> {
        match gate {
            // development-mode behavior: approval gates pass immediately
            GateKind::Approval => Ok(StepOutput::value(json!({
                "approved": true,
                "auto": true,
            }))),
            GateKind::Manual | GateKind::Review => Ok(StepOutput::waiting(json!({
                "status": "pending",
            }))),
            GateKind::Quality { metrics } => {
                let mut checked = serde_json::Map::new();
                for (path, threshold) in metrics {
                    let actual = ctx
                        .resolve_path(path)
                        .and_then(|v| v.as_f64())
                        .ok_or_else(|| {
                            StepError::Configuration(format!(
                                "quality gate metric '{path}' is absent or not numeric"
                            ))
                        })?;
                    if actual < *threshold {
                        return Err(StepError::Threshold {
                            metric: path.clone(),
                            expected: *threshold,
                            actual,
                        });
                    }
                    checked.insert(path.clone(), json!(actual));
                }
                Ok(StepOutput::value(json!({
                    "passed": true,
                    "metrics": checked,
                })))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Cancellable sleep.
    async fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<(), StepError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.cancelled() => Err(StepError::Cancelled {
                reason: cancel.reason_or_manual(),
            }),
        }
    }

    fn record(&self, ctx: &mut WorkflowContext, result: StepResult) -> Result<(), StepError> {
        ctx.record_step_result(result)
            .map_err(|e| StepError::execution("context_overflow", e.to_string()))
    }

    fn publish(&self, ctx: &WorkflowContext, kind: WorkflowEventKind) {
        self.events.publish(WorkflowEvent::new(
            ctx.system.execution_id,
            ctx.system.workflow_id.clone(),
            kind,
        ));
    }
}

fn has_reserved_prefix(path: &str) -> bool {
    ["input.", "output.", "variables.", "steps.", "system."]
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Walk a dotted path through a JSON value.
fn navigate_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Write a dotted path into a JSON value, creating intermediate objects.
fn set_path(root: &mut Value, path: &str, value: Value) {
    if !root.is_object() {
        *root = json!({});
    }
    match path.split_once('.') {
        Some((head, rest)) => {
            if let Some(map) = root.as_object_mut() {
                let child = map.entry(head.to_string()).or_insert_with(|| json!({}));
                set_path(child, rest, value);
            }
        }
        None => {
            if let Some(map) = root.as_object_mut() {
                map.insert(path.to_string(), value);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
