//! Error types for the runwright engine.
//!
//! The taxonomy follows the lifecycle of a pipeline:
//! - [`GraphError`] rejects a definition before any run exists.
//! - [`ExecutionError`] describes a single failed step attempt and is routed
//!   through the retry policy, never back to the caller.
//! - [`SchedulerInvariantError`] signals an engine bug and aborts the run.
//! - [`EngineError`] is what public entry points return.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;

/// The main error type for engine entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The pipeline definition was rejected.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// A run or step run was asked to make an illegal state transition.
    #[error("{0}")]
    Transition(#[from] TransitionError),

    /// An artifact could not be written or resolved.
    #[error("{0}")]
    Artifact(#[from] ArtifactError),

    /// The persistence collaborator failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// An internal scheduling invariant was violated.
    #[error("{0}")]
    Invariant(#[from] SchedulerInvariantError),

    /// Configuration could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// No worker could accept the run.
    #[error("No worker available{}", preferred.as_ref().map(|p| format!(" (requested '{p}')")).unwrap_or_default())]
    NoWorkerAvailable {
        /// The worker explicitly requested, if any.
        preferred: Option<String>,
    },

    /// The pipeline does not exist.
    #[error("Pipeline '{0}' not found")]
    PipelineNotFound(Uuid),

    /// The pipeline run does not exist.
    #[error("Pipeline run '{0}' not found")]
    RunNotFound(Uuid),

    /// The coordinator task terminated abnormally.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Metadata about a definition error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DiagnosticInfo {
    /// Error code (e.g., "GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl DiagnosticInfo {
    /// Creates a new diagnostic record.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised while validating a pipeline's dependency graph.
///
/// These are only ever produced at definition time (or by the defensive
/// re-check before scheduling) and always mean the pipeline is rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphError {
    /// The pipeline declares no steps.
    #[error("Pipeline must have at least one step")]
    EmptyPipeline,

    /// Two steps share a name.
    #[error("Step '{step}' is declared more than once")]
    DuplicateStep {
        /// The duplicated step name.
        step: String,
    },

    /// A step definition is malformed.
    #[error("Step '{step}' is invalid: {reason}")]
    InvalidStep {
        /// The offending step.
        step: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A dependency edge starts at a step that is not in the pipeline.
    #[error("Dependency edge references unknown step '{step}'")]
    UnknownStep {
        /// The unknown dependent step.
        step: String,
    },

    /// A dependency edge points at a step that is not in the pipeline.
    #[error("Step '{step}' depends on unknown step '{missing_dependency}'")]
    DanglingDependency {
        /// The dependent step.
        step: String,
        /// The dependency that does not exist.
        missing_dependency: String,
    },

    /// The same edge was declared twice.
    #[error("Dependency '{step}' -> '{depends_on}' is declared more than once")]
    DuplicateDependency {
        /// The dependent step.
        step: String,
        /// The dependency.
        depends_on: String,
    },

    /// The dependency edges contain at least one cycle.
    #[error("Cycle detected among steps: {}", involved_steps.join(", "))]
    CycleDetected {
        /// Steps on (or between) cycles, in declaration order.
        involved_steps: Vec<String>,
    },
}

impl GraphError {
    /// Returns the stable diagnostic code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyPipeline => "GRAPH-EMPTY",
            Self::DuplicateStep { .. } => "GRAPH-DUPLICATE-STEP",
            Self::InvalidStep { .. } => "GRAPH-INVALID-NAME",
            Self::UnknownStep { .. } => "GRAPH-UNKNOWN-STEP",
            Self::DanglingDependency { .. } => "GRAPH-DANGLING",
            Self::DuplicateDependency { .. } => "GRAPH-DUPLICATE-EDGE",
            Self::CycleDetected { .. } => "GRAPH-CYCLE",
        }
    }

    /// Returns the steps this error is about.
    #[must_use]
    pub fn steps(&self) -> Vec<String> {
        match self {
            Self::EmptyPipeline => Vec::new(),
            Self::DuplicateStep { step }
            | Self::InvalidStep { step, .. }
            | Self::UnknownStep { step } => vec![step.clone()],
            Self::DanglingDependency {
                step,
                missing_dependency,
            } => vec![step.clone(), missing_dependency.clone()],
            Self::DuplicateDependency { step, depends_on } => {
                vec![step.clone(), depends_on.clone()]
            }
            Self::CycleDetected { involved_steps } => involved_steps.clone(),
        }
    }

    /// Builds the diagnostic record surfaced to API callers.
    #[must_use]
    pub fn error_info(&self) -> DiagnosticInfo {
        let hint = match self {
            Self::EmptyPipeline => "Add at least one step to the pipeline.",
            Self::DuplicateStep { .. } => "Give every step a unique name.",
            Self::InvalidStep { .. } => {
                "Step names must start with a letter or digit and contain only letters, digits, '_', '.', '-'; commands must not be empty."
            }
            Self::UnknownStep { .. } | Self::DanglingDependency { .. } => {
                "Ensure all dependencies reference steps that exist in the pipeline. Check for typos in step names."
            }
            Self::DuplicateDependency { .. } => "Declare each dependency edge once.",
            Self::CycleDetected { .. } => {
                "Remove one of the dependencies in the cycle to break it."
            }
        };
        let mut info = DiagnosticInfo::new(self.code(), self.to_string()).with_fix_hint(hint);
        let steps = self.steps();
        if !steps.is_empty() {
            info = info.with_context_entry("steps", steps.join(","));
        }
        info
    }
}

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Presumed transient: timeouts, exhaustion, an unreachable backend.
    Application,
    /// Caused by the step's inputs or logic; retrying cannot help.
    Business,
}

impl ErrorClass {
    /// Returns true if errors of this class are eligible for retry.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Application)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => write!(f, "application"),
            Self::Business => write!(f, "business"),
        }
    }
}

/// Why a step attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The attempt exceeded its timeout.
    Timeout,
    /// The execution environment ran out of a resource.
    ResourceExhausted,
    /// The backend could not be reached or refused the submission.
    BackendUnavailable,
    /// The process was terminated by a signal.
    Signal,
    /// The process exited with a non-zero code.
    NonZeroExit,
    /// The step's input data was unusable.
    InvalidInput,
    /// A declared input artifact could not be resolved.
    MissingInput,
    /// The step detected a logic violation.
    LogicViolation,
    /// Anything else.
    Other,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource_exhausted",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Signal => "signal",
            Self::NonZeroExit => "non_zero_exit",
            Self::InvalidInput => "invalid_input",
            Self::MissingInput => "missing_input",
            Self::LogicViolation => "logic_violation",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// A failed step attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{class} error ({reason}): {message}")]
pub struct ExecutionError {
    /// Retry eligibility.
    pub class: ErrorClass,
    /// Failure cause.
    pub reason: FailureReason,
    /// Human readable detail.
    pub message: String,
}

impl ExecutionError {
    /// Creates an execution error.
    #[must_use]
    pub fn new(class: ErrorClass, reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            class,
            reason,
            message: message.into(),
        }
    }

    /// Creates a retry-eligible error.
    #[must_use]
    pub fn application(reason: FailureReason, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Application, reason, message)
    }

    /// Creates a non-retryable error.
    #[must_use]
    pub fn business(reason: FailureReason, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Business, reason, message)
    }

    /// The attempt ran longer than `limit`.
    #[must_use]
    pub fn timeout(limit: Duration) -> Self {
        Self::application(
            FailureReason::Timeout,
            format!("Step execution exceeded timeout of {:.3}s", limit.as_secs_f64()),
        )
    }

    /// The backend rejected or lost the execution.
    #[must_use]
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::application(FailureReason::BackendUnavailable, message)
    }

    /// Returns true if the retry policy may retry this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

/// An engine bug: the scheduler reached a state that must be impossible.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Scheduler invariant violated in run {run_id}: {message}")]
pub struct SchedulerInvariantError {
    /// The run being coordinated.
    pub run_id: Uuid,
    /// The step involved, if any.
    pub step: Option<String>,
    /// What went wrong.
    pub message: String,
    /// Diagnostic state captured at the point of failure.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl SchedulerInvariantError {
    /// Creates a new invariant error.
    #[must_use]
    pub fn new(run_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            run_id,
            step: None,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Names the step involved.
    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Adds a diagnostic entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// An illegal status change on a run record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cannot move {entity} {id} from '{from}' to '{to}'")]
pub struct TransitionError {
    /// "pipeline_run" or "step_run".
    pub entity: &'static str,
    /// The record identifier.
    pub id: Uuid,
    /// Current status.
    pub from: String,
    /// Requested status.
    pub to: String,
}

impl TransitionError {
    /// Creates a transition error.
    #[must_use]
    pub fn new(entity: &'static str, id: Uuid, from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self {
            entity,
            id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Errors raised by the artifact registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArtifactError {
    /// Artifact names follow the same rules as step names.
    #[error("Invalid artifact name '{name}'")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Both an external reference and inline data were supplied.
    #[error("Artifact '{name}' sets both uri and data; exactly one is allowed")]
    PayloadConflict {
        /// The artifact name.
        name: String,
    },

    /// Neither an external reference nor inline data was supplied.
    #[error("Artifact '{name}' sets neither uri nor data; exactly one is required")]
    PayloadMissing {
        /// The artifact name.
        name: String,
    },

    /// No dependency produced the declared input.
    #[error("Step '{step}' declares input '{input}' but no dependency produced it")]
    MissingInput {
        /// The consuming step.
        step: String,
        /// The input reference.
        input: String,
    },

    /// More than one dependency produced an input with this name.
    #[error("Step '{step}' input '{input}' is produced by several dependencies ({}); qualify it as 'producer/name'", producers.join(", "))]
    AmbiguousInput {
        /// The consuming step.
        step: String,
        /// The input reference.
        input: String,
        /// Dependencies that produced it.
        producers: Vec<String>,
    },

    /// A qualified input names a step that is not a dependency.
    #[error("Step '{step}' input '{input}' names '{producer}', which is not one of its dependencies")]
    ProducerNotDependency {
        /// The consuming step.
        step: String,
        /// The input reference.
        input: String,
        /// The named producer.
        producer: String,
    },

    /// An artifact version was written twice.
    #[error("Artifact {key} already exists")]
    AlreadyExists {
        /// Display form of the artifact key.
        key: String,
    },
}

/// Errors raised by the persistence collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The record does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Record kind.
        entity: &'static str,
        /// Record id.
        id: Uuid,
    },

    /// The record already exists.
    #[error("{entity} '{id}' already exists")]
    AlreadyExists {
        /// Record kind.
        entity: &'static str,
        /// Record id.
        id: Uuid,
    },

    /// An optimistic update lost against a newer revision.
    #[error("Stale update for '{id}': stored revision {stored}, attempted {attempted}")]
    StaleRevision {
        /// Record id.
        id: Uuid,
        /// Revision currently stored.
        stored: u64,
        /// Revision of the rejected write.
        attempted: u64,
    },

    /// The backing store could not serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_info_creation() {
        let info = DiagnosticInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("step", "my_step");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("step"), Some(&"my_step".to_string()));
    }

    #[test]
    fn test_cycle_error_info() {
        let err = GraphError::CycleDetected {
            involved_steps: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("a, b"));
        let info = err.error_info();
        assert_eq!(info.code, "GRAPH-CYCLE");
        assert_eq!(info.context.get("steps"), Some(&"a,b".to_string()));
    }

    #[test]
    fn test_dangling_dependency_display() {
        let err = GraphError::DanglingDependency {
            step: "train".into(),
            missing_dependency: "fetch".into(),
        };
        assert_eq!(err.to_string(), "Step 'train' depends on unknown step 'fetch'");
        assert_eq!(err.steps(), vec!["train".to_string(), "fetch".to_string()]);
    }

    #[test]
    fn test_graph_error_serializes_with_kind_tag() {
        let err = GraphError::DuplicateStep { step: "a".into() };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "duplicate_step");
    }

    #[test]
    fn test_error_class_retryable() {
        assert!(ErrorClass::Application.is_retryable());
        assert!(!ErrorClass::Business.is_retryable());
    }

    #[test]
    fn test_execution_error_constructors() {
        let err = ExecutionError::timeout(Duration::from_millis(1500));
        assert_eq!(err.reason, FailureReason::Timeout);
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("application error (timeout)"));

        let err = ExecutionError::business(FailureReason::InvalidInput, "bad csv");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_engine_error_no_worker_display() {
        let err = EngineError::NoWorkerAvailable {
            preferred: Some("gpu-1".into()),
        };
        assert_eq!(err.to_string(), "No worker available (requested 'gpu-1')");
        let err = EngineError::NoWorkerAvailable { preferred: None };
        assert_eq!(err.to_string(), "No worker available");
    }

    #[test]
    fn test_invariant_error_context() {
        let run_id = Uuid::nil();
        let err = SchedulerInvariantError::new(run_id, "dispatched too early")
            .with_step("b")
            .with_context("pending_dependencies", "a");
        assert_eq!(err.step.as_deref(), Some("b"));
        assert_eq!(err.context.len(), 1);
    }
}
