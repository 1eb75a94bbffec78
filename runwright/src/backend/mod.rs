//! Execution backend contract and worker bindings.
//!
//! The scheduler only talks to [`ExecutionBackend`]; whether a step runs as
//! a local process, in a container or on a remote host is decided by which
//! backend a [`WorkerPool`] hands out for the run.

#[cfg(feature = "local-backend")]
mod local;
mod worker;

#[cfg(feature = "local-backend")]
pub use local::LocalProcessBackend;
pub use worker::{Worker, WorkerInfo, WorkerLease, WorkerPool, WorkerStatus};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::artifacts::ResolvedInputs;
use crate::core::ArtifactPayload;
use crate::errors::ExecutionError;
use crate::pipeline::{CommandDescriptor, Step};

/// What a backend needs to know about the step it executes.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDescriptor {
    /// Step name.
    pub step: String,
    /// Command and step-level environment.
    pub command: CommandDescriptor,
    /// Output artifact names the step declares.
    pub outputs: Vec<String>,
    /// Per-attempt timeout enforced by the scheduler.
    pub timeout: Duration,
}

impl StepDescriptor {
    /// Builds a descriptor from a step definition.
    #[must_use]
    pub fn from_step(step: &Step, default_timeout: Duration) -> Self {
        Self {
            step: step.name.clone(),
            command: step.command.clone(),
            outputs: step.outputs.clone(),
            timeout: step.timeout(default_timeout),
        }
    }
}

/// Execution metadata handed to the backend with every submission.
#[derive(Clone, Default)]
pub struct ExecutionEnv {
    /// The run.
    pub pipeline_run_id: Uuid,
    /// The step run.
    pub step_run_id: Uuid,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Engine-wide environment variables.
    pub vars: BTreeMap<String, String>,
    /// Secret environment variables; never logged.
    pub secrets: BTreeMap<String, String>,
}

impl ExecutionEnv {
    /// Creates an environment for one attempt.
    #[must_use]
    pub fn new(pipeline_run_id: Uuid, step_run_id: Uuid, attempt: u32) -> Self {
        Self {
            pipeline_run_id,
            step_run_id,
            attempt,
            vars: BTreeMap::new(),
            secrets: BTreeMap::new(),
        }
    }

    /// Adds engine-wide variables.
    #[must_use]
    pub fn with_vars(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.vars.extend(vars);
        self
    }

    /// Adds secrets.
    #[must_use]
    pub fn with_secrets(mut self, secrets: impl IntoIterator<Item = (String, String)>) -> Self {
        self.secrets.extend(secrets);
        self
    }
}

impl fmt::Debug for ExecutionEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted: BTreeMap<&str, &str> =
            self.secrets.keys().map(|k| (k.as_str(), "***")).collect();
        f.debug_struct("ExecutionEnv")
            .field("pipeline_run_id", &self.pipeline_run_id)
            .field("step_run_id", &self.step_run_id)
            .field("attempt", &self.attempt)
            .field("vars", &self.vars)
            .field("secrets", &redacted)
            .finish()
    }
}

/// Identifies one submitted execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionHandle {
    /// Backend-assigned execution id.
    pub id: Uuid,
    /// Name of the backend holding the execution.
    pub backend: String,
    /// The step run being executed.
    pub step_run_id: Uuid,
}

/// Backend-side status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Accepted, not started.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Aborted through [`ExecutionBackend::cancel`].
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true once the execution has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// An output artifact reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredOutput {
    /// Artifact name; must be one of the step's declared outputs.
    pub name: String,
    /// Reference or inline data.
    pub payload: ArtifactPayload,
    /// Extra artifact metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl DeclaredOutput {
    /// Creates an output without metadata.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: ArtifactPayload) -> Self {
        Self {
            name: name.into(),
            payload,
            metadata: HashMap::new(),
        }
    }
}

/// The outcome of a finished execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Final backend status.
    pub status: ExecutionStatus,
    /// Process exit code; `None` if terminated by a signal or not a process.
    pub exit_code: Option<i32>,
    /// Captured output of the attempt.
    pub logs: String,
    /// Artifacts the step produced.
    pub outputs: Vec<DeclaredOutput>,
    /// Classified failure, if the backend could classify it.
    pub error: Option<ExecutionError>,
    /// Execution metrics.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ExecutionResult {
    /// A successful result.
    #[must_use]
    pub fn success(logs: impl Into<String>, outputs: Vec<DeclaredOutput>) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            exit_code: Some(0),
            logs: logs.into(),
            outputs,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failure(
        exit_code: Option<i32>,
        logs: impl Into<String>,
        error: Option<ExecutionError>,
    ) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            exit_code,
            logs: logs.into(),
            outputs: Vec::new(),
            error,
            metadata: HashMap::new(),
        }
    }
}

/// A place steps can be executed.
///
/// Errors returned from any method are treated as failed attempts and go
/// through the retry policy like any other failure.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Backend name, recorded in handles.
    fn name(&self) -> &str;

    /// Starts executing a step.
    async fn submit(
        &self,
        step: &StepDescriptor,
        inputs: &ResolvedInputs,
        env: &ExecutionEnv,
    ) -> Result<ExecutionHandle, ExecutionError>;

    /// Reports the current status without blocking.
    async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ExecutionError>;

    /// Returns the outcome of a finished execution.
    async fn fetch_result(&self, handle: &ExecutionHandle)
        -> Result<ExecutionResult, ExecutionError>;

    /// Aborts an execution best-effort. Returns true if it is no longer running.
    async fn cancel(&self, handle: &ExecutionHandle) -> Result<bool, ExecutionError>;

    /// Releases resources held for an execution.
    async fn cleanup(&self, _handle: &ExecutionHandle) -> Result<(), ExecutionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_debug_redacts_secrets() {
        let env = ExecutionEnv::new(Uuid::nil(), Uuid::nil(), 1)
            .with_vars([("REGION".to_string(), "eu".to_string())])
            .with_secrets([("API_TOKEN".to_string(), "hunter2".to_string())]);
        let rendered = format!("{env:?}");
        assert!(rendered.contains("API_TOKEN"));
        assert!(rendered.contains("REGION"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_descriptor_uses_step_timeout() {
        let step = Step::new("a", "true").with_timeout_secs(2.0).with_output("x");
        let descriptor = StepDescriptor::from_step(&step, Duration::from_secs(60));
        assert_eq!(descriptor.timeout, Duration::from_secs(2));
        assert_eq!(descriptor.outputs, vec!["x".to_string()]);
    }

    #[test]
    fn test_execution_status_terminal() {
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
