//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and the canonical `WorkflowDefinition` IR,
//! validates structural constraints (unique IDs, valid entry step, sane
//! transitions), and provides discovery for workflow files on disk.
//! Validation runs at load time; a definition that parses is structurally
//! valid before the engine ever sees it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use stepflow_types::workflow::{StepKind, Transition, WorkflowDefinition, WorkflowStep};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from definition parsing, validation, and file handling.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - ID and version are non-empty; the ID uses only alphanumerics, hyphens,
///   and underscores
/// - At least one step exists
/// - Step IDs are unique across the whole tree, nested steps included
/// - `entry_step_id` names a top-level step
/// - Transitions reference existing top-level steps, with at most one
///   default per source step
/// - Retry, loop, and parallel numeric fields are sane
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.id.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow id must not be empty".to_string(),
        ));
    }
    if !def
        .id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DefinitionError::Validation(format!(
            "workflow id '{}' contains invalid characters (only alphanumerics, hyphens, and underscores allowed)",
            def.id
        )));
    }
    if def.version.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow version must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow must have at least one step".to_string(),
        ));
    }

    // Unique step IDs across the whole tree
    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        collect_step_ids(step, &mut seen_ids)?;
    }

    // Entry step must be a top-level step
    let top_level: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
    if !top_level.contains(def.entry_step_id.as_str()) {
        return Err(DefinitionError::Validation(format!(
            "entry step '{}' is not a top-level step",
            def.entry_step_id
        )));
    }

    validate_transitions(&def.transitions, &top_level)?;

    for step in &def.steps {
        validate_step(step)?;
    }

    if let Some(timeout_ms) = def.timeout_ms {
        if timeout_ms == 0 {
            return Err(DefinitionError::Validation(
                "timeout_ms must be > 0".to_string(),
            ));
        }
    }

    Ok(())
}

fn collect_step_ids<'a>(
    step: &'a WorkflowStep,
    seen: &mut HashSet<&'a str>,
) -> Result<(), DefinitionError> {
    if !seen.insert(step.id.as_str()) {
        return Err(DefinitionError::Validation(format!(
            "duplicate step ID: '{}'",
            step.id
        )));
    }
    match &step.kind {
        StepKind::Sequential { steps, .. } | StepKind::Parallel { steps, .. } => {
            for child in steps {
                collect_step_ids(child, seen)?;
            }
        }
        StepKind::Conditional {
            then_step,
            else_step,
            ..
        } => {
            collect_step_ids(then_step, seen)?;
            if let Some(else_step) = else_step {
                collect_step_ids(else_step, seen)?;
            }
        }
        StepKind::Loop { body, .. } => collect_step_ids(body, seen)?,
        _ => {}
    }
    Ok(())
}

fn validate_transitions(
    transitions: &[Transition],
    top_level: &HashSet<&str>,
) -> Result<(), DefinitionError> {
    let mut defaults: HashSet<&str> = HashSet::new();
    for transition in transitions {
        if !top_level.contains(transition.from.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "transition source '{}' is not a top-level step",
                transition.from
            )));
        }
        if !top_level.contains(transition.to.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "transition target '{}' is not a top-level step",
                transition.to
            )));
        }
        if transition.is_default && !defaults.insert(transition.from.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "step '{}' has more than one default transition",
                transition.from
            )));
        }
    }
    Ok(())
}

fn validate_step(step: &WorkflowStep) -> Result<(), DefinitionError> {
    if step.id.is_empty() {
        return Err(DefinitionError::Validation(
            "step id must not be empty".to_string(),
        ));
    }

    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            return Err(DefinitionError::Validation(format!(
                "step '{}': retry max_attempts must be >= 1",
                step.id
            )));
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(DefinitionError::Validation(format!(
                "step '{}': retry backoff_multiplier must be >= 1.0",
                step.id
            )));
        }
    }

    match &step.kind {
        StepKind::Agent { agent_id, .. } => {
            if agent_id.is_empty() {
                return Err(DefinitionError::Validation(format!(
                    "step '{}': agent_id must not be empty",
                    step.id
                )));
            }
        }
        StepKind::Sequential { steps, .. } => {
            if steps.is_empty() {
                return Err(DefinitionError::Validation(format!(
                    "step '{}': sequential step must have children",
                    step.id
                )));
            }
            for child in steps {
                validate_step(child)?;
            }
        }
        StepKind::Parallel {
            steps,
            max_concurrency,
            min_successful,
            ..
        } => {
            if steps.is_empty() {
                return Err(DefinitionError::Validation(format!(
                    "step '{}': parallel step must have children",
                    step.id
                )));
            }
            if let Some(0) = max_concurrency {
                return Err(DefinitionError::Validation(format!(
                    "step '{}': max_concurrency must be >= 1",
                    step.id
                )));
            }
            if let Some(min) = min_successful {
                if *min > steps.len() {
                    return Err(DefinitionError::Validation(format!(
                        "step '{}': min_successful ({min}) exceeds child count ({})",
                        step.id,
                        steps.len()
                    )));
                }
            }
            for child in steps {
                validate_step(child)?;
            }
        }
        StepKind::Conditional {
            then_step,
            else_step,
            ..
        } => {
            validate_step(then_step)?;
            if let Some(else_step) = else_step {
                validate_step(else_step)?;
            }
        }
        StepKind::Loop {
            max_iterations,
            body,
            ..
        } => {
            if *max_iterations == 0 {
                return Err(DefinitionError::Validation(format!(
                    "step '{}': max_iterations must be >= 1",
                    step.id
                )));
            }
            validate_step(body)?;
        }
        StepKind::Transform {
            spec,
            output_variable,
            ..
        } => {
            if spec.is_empty() {
                return Err(DefinitionError::Validation(format!(
                    "step '{}': transform spec must not be empty",
                    step.id
                )));
            }
            if output_variable.is_empty() {
                return Err(DefinitionError::Validation(format!(
                    "step '{}': transform output_variable must not be empty",
                    step.id
                )));
            }
        }
        StepKind::Wait { .. } | StepKind::Gate { .. } | StepKind::Subworkflow { .. } => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Files that fail to parse
/// are skipped with a warning (they may not be workflows).
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_workflow_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(_) => {
                        tracing::warn!(?path, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
