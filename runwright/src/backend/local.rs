//! Local process execution backend.
//!
//! Each attempt runs as `sh -c <command>` in its own execution directory:
//!
//! ```text
//! <root>/<execution_id>/
//!     inputs/      text inputs written as files
//!     artifacts/   where the step writes its declared outputs
//!     output.log   combined stdout and stderr
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    DeclaredOutput, ExecutionBackend, ExecutionEnv, ExecutionHandle, ExecutionResult,
    ExecutionStatus, StepDescriptor,
};
use crate::artifacts::ResolvedInputs;
use crate::core::ArtifactPayload;
use crate::errors::{ExecutionError, FailureReason};
use crate::utils::random_id;

const LOG_FILE: &str = "output.log";

struct LocalExecution {
    child: Child,
    artifacts_dir: PathBuf,
    log_path: PathBuf,
    execution_dir: PathBuf,
    outputs: Vec<String>,
    started: Instant,
    status: ExecutionStatus,
    exit_code: Option<i32>,
}

impl LocalExecution {
    /// Refreshes `status` from the child without blocking.
    fn refresh(&mut self) -> Result<ExecutionStatus, ExecutionError> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }
        match self.child.try_wait() {
            Ok(Some(exit)) => {
                self.exit_code = exit.code();
                self.status = if exit.success() {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
            }
            Ok(None) => self.status = ExecutionStatus::Running,
            Err(e) => {
                return Err(ExecutionError::backend_unavailable(format!(
                    "Failed to query process status: {e}"
                )))
            }
        }
        Ok(self.status)
    }
}

/// Runs steps as local shell processes.
pub struct LocalProcessBackend {
    name: String,
    root: PathBuf,
    working_directory: Option<PathBuf>,
    executions: DashMap<Uuid, Arc<Mutex<LocalExecution>>>,
}

impl std::fmt::Debug for LocalProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessBackend")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("executions", &self.executions.len())
            .finish()
    }
}

impl LocalProcessBackend {
    /// Creates a backend that keeps execution directories under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            name: "local".to_string(),
            root: root.into(),
            working_directory: None,
            executions: DashMap::new(),
        }
    }

    /// Sets the backend name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Runs every command in `dir` instead of its execution directory.
    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Root directory for execution directories.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Execution directory of a live execution.
    #[must_use]
    pub fn execution_dir(&self, handle: &ExecutionHandle) -> Option<PathBuf> {
        self.executions
            .get(&handle.id)
            .map(|entry| entry.lock().execution_dir.clone())
    }

    fn execution(&self, handle: &ExecutionHandle) -> Result<Arc<Mutex<LocalExecution>>, ExecutionError> {
        self.executions
            .get(&handle.id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ExecutionError::application(
                    FailureReason::Other,
                    format!("Execution {} not found", handle.id),
                )
            })
    }
}

/// `train/model` → `TRAIN_MODEL`.
fn env_key(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn io_error(context: &str, err: &std::io::Error) -> ExecutionError {
    ExecutionError::application(FailureReason::ResourceExhausted, format!("{context}: {err}"))
}

#[async_trait]
impl ExecutionBackend for LocalProcessBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(
        &self,
        step: &StepDescriptor,
        inputs: &ResolvedInputs,
        env: &ExecutionEnv,
    ) -> Result<ExecutionHandle, ExecutionError> {
        let execution_id = random_id();
        let execution_dir = self.root.join(execution_id.to_string());
        let inputs_dir = execution_dir.join("inputs");
        let artifacts_dir = execution_dir.join("artifacts");
        for dir in [&inputs_dir, &artifacts_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error("Failed to create execution directory", &e))?;
        }

        let mut input_vars = Vec::with_capacity(inputs.len());
        for (declared, artifact) in inputs {
            let path = match &artifact.payload {
                ArtifactPayload::File { uri } => uri.clone(),
                ArtifactPayload::Text { data } => {
                    let path = inputs_dir.join(declared.replace('/', "__"));
                    tokio::fs::write(&path, data)
                        .await
                        .map_err(|e| io_error("Failed to stage input", &e))?;
                    path.to_string_lossy().into_owned()
                }
            };
            input_vars.push((format!("RUNWRIGHT_INPUT_{}", env_key(declared)), path));
        }

        let log_path = execution_dir.join(LOG_FILE);
        let stdout = std::fs::File::create(&log_path)
            .map_err(|e| io_error("Failed to create log file", &e))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| io_error("Failed to create log file", &e))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&step.command.command)
            .current_dir(self.working_directory.as_ref().unwrap_or(&execution_dir))
            .envs(&env.vars)
            .envs(&env.secrets)
            .envs(&step.command.env)
            .envs(input_vars)
            .env("RUNWRIGHT_INPUTS_DIR", &inputs_dir)
            .env("RUNWRIGHT_ARTIFACTS_DIR", &artifacts_dir)
            .env("RUNWRIGHT_EXECUTION_ID", execution_id.to_string())
            .env("RUNWRIGHT_STEP_RUN_ID", env.step_run_id.to_string())
            .env("RUNWRIGHT_PIPELINE_RUN_ID", env.pipeline_run_id.to_string())
            .env("RUNWRIGHT_ATTEMPT", env.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            ExecutionError::backend_unavailable(format!("Failed to start process: {e}"))
        })?;

        debug!(
            step = %step.step,
            execution_id = %execution_id,
            pid = ?child.id(),
            "Local process started"
        );

        self.executions.insert(
            execution_id,
            Arc::new(Mutex::new(LocalExecution {
                child,
                artifacts_dir,
                log_path,
                execution_dir,
                outputs: step.outputs.clone(),
                started: Instant::now(),
                status: ExecutionStatus::Running,
                exit_code: None,
            })),
        );

        Ok(ExecutionHandle {
            id: execution_id,
            backend: self.name.clone(),
            step_run_id: env.step_run_id,
        })
    }

    async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ExecutionError> {
        self.execution(handle)?.lock().refresh()
    }

    async fn fetch_result(
        &self,
        handle: &ExecutionHandle,
    ) -> Result<ExecutionResult, ExecutionError> {
        let execution = self.execution(handle)?;
        let (status, exit_code, log_path, artifacts_dir, outputs, elapsed) = {
            let mut guard = execution.lock();
            let status = guard.refresh()?;
            (
                status,
                guard.exit_code,
                guard.log_path.clone(),
                guard.artifacts_dir.clone(),
                guard.outputs.clone(),
                guard.started.elapsed(),
            )
        };

        if !status.is_terminal() {
            return Err(ExecutionError::application(
                FailureReason::Other,
                format!("Execution {} has not finished", handle.id),
            ));
        }

        let logs = match tokio::fs::read(&log_path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => format!("Failed to read logs: {e}"),
        };

        let mut declared = Vec::new();
        if status == ExecutionStatus::Completed {
            for name in outputs {
                let path = artifacts_dir.join(&name);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    declared.push(DeclaredOutput::new(
                        name,
                        ArtifactPayload::file(path.to_string_lossy()),
                    ));
                }
            }
        }

        let error = match (status, exit_code) {
            (ExecutionStatus::Cancelled, _) => Some(ExecutionError::application(
                FailureReason::Signal,
                "Execution was cancelled",
            )),
            (ExecutionStatus::Failed, None) => Some(ExecutionError::application(
                FailureReason::Signal,
                "Process terminated by signal",
            )),
            // Plain non-zero exits are left for the retry policy to classify.
            _ => None,
        };

        let mut metadata = HashMap::new();
        metadata.insert(
            "execution_time_ms".to_string(),
            Value::from(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)),
        );

        Ok(ExecutionResult {
            status,
            exit_code,
            logs,
            outputs: declared,
            error,
            metadata,
        })
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<bool, ExecutionError> {
        let execution = self.execution(handle)?;
        let mut guard = execution.lock();
        if guard.refresh()?.is_terminal() {
            return Ok(true);
        }
        match guard.child.start_kill() {
            Ok(()) => {
                guard.status = ExecutionStatus::Cancelled;
                Ok(true)
            }
            Err(e) => {
                warn!(execution_id = %handle.id, error = %e, "Failed to kill process");
                Ok(false)
            }
        }
    }

    async fn cleanup(&self, handle: &ExecutionHandle) -> Result<(), ExecutionError> {
        if let Some((_, execution)) = self.executions.remove(&handle.id) {
            let mut guard = execution.lock();
            if !guard.refresh()?.is_terminal() {
                let _ = guard.child.start_kill();
            }
        }
        // The execution directory stays: file artifacts point into it.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Artifact;
    use crate::core::ArtifactKey;
    use crate::utils::now_utc;
    use std::time::Duration;

    async fn wait_terminal(backend: &LocalProcessBackend, handle: &ExecutionHandle) -> ExecutionStatus {
        for _ in 0..200 {
            let status = backend.poll(handle).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("execution did not finish");
    }

    fn descriptor(command: &str) -> StepDescriptor {
        StepDescriptor {
            step: "s".into(),
            command: crate::pipeline::CommandDescriptor::new(command),
            outputs: vec!["result.txt".into()],
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_env_key() {
        assert_eq!(env_key("train/model.v2"), "TRAIN_MODEL_V2");
    }

    #[tokio::test]
    async fn test_successful_process_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalProcessBackend::new(dir.path());
        let env = ExecutionEnv::new(Uuid::nil(), Uuid::nil(), 1)
            .with_vars([("GREETING".to_string(), "hello".to_string())]);

        let handle = backend
            .submit(
                &descriptor(r#"echo "$GREETING" && echo done > "$RUNWRIGHT_ARTIFACTS_DIR/result.txt""#),
                &ResolvedInputs::new(),
                &env,
            )
            .await
            .unwrap();

        assert_eq!(wait_terminal(&backend, &handle).await, ExecutionStatus::Completed);
        let result = backend.fetch_result(&handle).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.logs.contains("hello"));
        assert_eq!(result.outputs.len(), 1);
        assert!(result.outputs[0].payload.uri().unwrap().ends_with("result.txt"));
        backend.cleanup(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_zero_exit_left_unclassified() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalProcessBackend::new(dir.path());
        let handle = backend
            .submit(&descriptor("echo boom >&2; exit 3"), &ResolvedInputs::new(), &ExecutionEnv::default())
            .await
            .unwrap();

        assert_eq!(wait_terminal(&backend, &handle).await, ExecutionStatus::Failed);
        let result = backend.fetch_result(&handle).await.unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert!(result.logs.contains("boom"));
        assert!(result.error.is_none());
        assert!(result.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_text_inputs_are_staged() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalProcessBackend::new(dir.path());
        let mut inputs = ResolvedInputs::new();
        inputs.insert(
            "prep/data".to_string(),
            Arc::new(Artifact {
                id: Uuid::nil(),
                key: ArtifactKey {
                    pipeline_run_id: Uuid::nil(),
                    step: "prep".into(),
                    name: "data".into(),
                    version: 1,
                },
                producer_step_run_id: Uuid::nil(),
                payload: ArtifactPayload::text("payload-123"),
                metadata: HashMap::new(),
                created_at: now_utc(),
            }),
        );

        let handle = backend
            .submit(&descriptor(r#"cat "$RUNWRIGHT_INPUT_PREP_DATA""#), &inputs, &ExecutionEnv::default())
            .await
            .unwrap();
        assert_eq!(wait_terminal(&backend, &handle).await, ExecutionStatus::Completed);
        let result = backend.fetch_result(&handle).await.unwrap();
        assert!(result.logs.contains("payload-123"));
    }

    #[tokio::test]
    async fn test_cancel_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalProcessBackend::new(dir.path());
        let handle = backend
            .submit(&descriptor("sleep 30"), &ResolvedInputs::new(), &ExecutionEnv::default())
            .await
            .unwrap();

        assert!(backend.cancel(&handle).await.unwrap());
        assert_eq!(backend.poll(&handle).await.unwrap(), ExecutionStatus::Cancelled);
        let result = backend.fetch_result(&handle).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        backend.cleanup(&handle).await.unwrap();
        assert!(backend.poll(&handle).await.is_err());
    }
}
