//! A scriptable in-memory execution backend.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::artifacts::ResolvedInputs;
use crate::backend::{
    DeclaredOutput, ExecutionBackend, ExecutionEnv, ExecutionHandle, ExecutionResult,
    ExecutionStatus, StepDescriptor,
};
use crate::core::ArtifactPayload;
use crate::errors::{ErrorClass, ExecutionError, FailureReason};

/// What one scripted attempt does.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    /// Exit 0 with a text artifact for every declared output.
    Succeed,
    /// Exit 0 with exactly these outputs.
    SucceedWith(Vec<DeclaredOutput>),
    /// Fail with a classified error.
    Fail {
        /// Error class.
        class: ErrorClass,
        /// Failure cause.
        reason: FailureReason,
        /// Reported exit code.
        exit_code: Option<i32>,
        /// Error message.
        message: String,
    },
    /// Exit with a non-zero code and no classification.
    Exit(i32),
    /// Reject the submission.
    SubmitError(ExecutionError),
    /// Never finish on its own.
    Hang,
}

impl ScriptedOutcome {
    /// A retry-eligible failure.
    #[must_use]
    pub fn application_failure(message: impl Into<String>) -> Self {
        Self::Fail {
            class: ErrorClass::Application,
            reason: FailureReason::ResourceExhausted,
            exit_code: Some(1),
            message: message.into(),
        }
    }

    /// A non-retryable failure.
    #[must_use]
    pub fn business_failure(message: impl Into<String>) -> Self {
        Self::Fail {
            class: ErrorClass::Business,
            reason: FailureReason::InvalidInput,
            exit_code: Some(2),
            message: message.into(),
        }
    }
}

/// One recorded submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Step name.
    pub step: String,
    /// Step run id.
    pub step_run_id: Uuid,
    /// 1-based attempt.
    pub attempt: u32,
    /// Resolved inputs by declaration, with their payloads.
    pub inputs: BTreeMap<String, ArtifactPayload>,
    /// Versions of the resolved inputs.
    pub input_versions: BTreeMap<String, u32>,
    /// Engine environment passed along.
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug)]
struct ScriptedExecution {
    step: String,
    attempt: u32,
    outputs: Vec<String>,
    outcome: ScriptedOutcome,
    started: Instant,
    cancelled: bool,
    finished: bool,
}

impl ScriptedExecution {
    fn status(&self, latency: Duration) -> ExecutionStatus {
        if self.cancelled {
            return ExecutionStatus::Cancelled;
        }
        if matches!(self.outcome, ScriptedOutcome::Hang) || self.started.elapsed() < latency {
            return ExecutionStatus::Running;
        }
        match self.outcome {
            ScriptedOutcome::Succeed | ScriptedOutcome::SucceedWith(_) => ExecutionStatus::Completed,
            _ => ExecutionStatus::Failed,
        }
    }
}

/// An [`ExecutionBackend`] whose attempts follow per-step scripts.
///
/// Steps without a script succeed. Every attempt takes `latency` before it
/// reports a terminal status.
#[derive(Debug)]
pub struct ScriptedBackend {
    name: String,
    latency: Duration,
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    executions: DashMap<Uuid, ScriptedExecution>,
    dispatches: Mutex<Vec<Dispatch>>,
    cancelled: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Creates a backend with 10ms attempts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "scripted".to_string(),
            latency: Duration::from_millis(10),
            scripts: Mutex::new(HashMap::new()),
            executions: DashMap::new(),
            dispatches: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Renames the backend.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets how long each attempt runs.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queues outcomes for the next attempts of `step`.
    #[must_use]
    pub fn script(self, step: &str, outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        self.scripts
            .lock()
            .entry(step.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Every submission so far.
    #[must_use]
    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches.lock().clone()
    }

    /// Step names in submission order.
    #[must_use]
    pub fn dispatched_steps(&self) -> Vec<String> {
        self.dispatches.lock().iter().map(|d| d.step.clone()).collect()
    }

    /// Number of submissions of `step`.
    #[must_use]
    pub fn attempts_of(&self, step: &str) -> usize {
        self.dispatches.lock().iter().filter(|d| d.step == step).count()
    }

    /// Steps whose executions were cancelled.
    #[must_use]
    pub fn cancelled_steps(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    /// Highest number of simultaneously running executions observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, step: &str) -> ScriptedOutcome {
        self.scripts
            .lock()
            .get_mut(step)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedOutcome::Succeed)
    }

    fn mark_finished(&self, execution: &mut ScriptedExecution) {
        if !execution.finished {
            execution.finished = true;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn unknown(handle: &ExecutionHandle) -> ExecutionError {
        ExecutionError::backend_unavailable(format!("Unknown execution {}", handle.id))
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(
        &self,
        step: &StepDescriptor,
        inputs: &ResolvedInputs,
        env: &ExecutionEnv,
    ) -> Result<ExecutionHandle, ExecutionError> {
        self.dispatches.lock().push(Dispatch {
            step: step.step.clone(),
            step_run_id: env.step_run_id,
            attempt: env.attempt,
            inputs: inputs
                .iter()
                .map(|(k, a)| (k.clone(), a.payload.clone()))
                .collect(),
            input_versions: inputs.iter().map(|(k, a)| (k.clone(), a.version())).collect(),
            vars: env.vars.clone(),
        });

        let outcome = self.next_outcome(&step.step);
        if let ScriptedOutcome::SubmitError(error) = outcome {
            return Err(error);
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let id = Uuid::new_v4();
        self.executions.insert(
            id,
            ScriptedExecution {
                step: step.step.clone(),
                attempt: env.attempt,
                outputs: step.outputs.clone(),
                outcome,
                started: Instant::now(),
                cancelled: false,
                finished: false,
            },
        );
        Ok(ExecutionHandle {
            id,
            backend: self.name.clone(),
            step_run_id: env.step_run_id,
        })
    }

    async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ExecutionError> {
        let mut execution = self
            .executions
            .get_mut(&handle.id)
            .ok_or_else(|| Self::unknown(handle))?;
        let status = execution.status(self.latency);
        if status.is_terminal() {
            self.mark_finished(&mut execution);
        }
        Ok(status)
    }

    async fn fetch_result(
        &self,
        handle: &ExecutionHandle,
    ) -> Result<ExecutionResult, ExecutionError> {
        let mut execution = self
            .executions
            .get_mut(&handle.id)
            .ok_or_else(|| Self::unknown(handle))?;
        let status = execution.status(self.latency);
        if !status.is_terminal() {
            return Err(ExecutionError::application(
                FailureReason::Other,
                format!("Execution {} has not finished", handle.id),
            ));
        }
        self.mark_finished(&mut execution);

        let logs = format!("{} attempt {}\n", execution.step, execution.attempt);
        if status == ExecutionStatus::Cancelled {
            return Ok(ExecutionResult {
                status,
                ..ExecutionResult::failure(None, logs, None)
            });
        }

        let result = match &execution.outcome {
            ScriptedOutcome::Succeed => {
                let outputs = execution
                    .outputs
                    .iter()
                    .map(|name| {
                        DeclaredOutput::new(
                            name.clone(),
                            ArtifactPayload::text(format!(
                                "{}:{}:attempt{}",
                                execution.step, name, execution.attempt
                            )),
                        )
                    })
                    .collect();
                ExecutionResult::success(logs, outputs)
            }
            ScriptedOutcome::SucceedWith(outputs) => ExecutionResult::success(logs, outputs.clone()),
            ScriptedOutcome::Fail {
                class,
                reason,
                exit_code,
                message,
            } => ExecutionResult::failure(
                *exit_code,
                logs,
                Some(ExecutionError::new(*class, *reason, message.clone())),
            ),
            ScriptedOutcome::Exit(code) => ExecutionResult::failure(Some(*code), logs, None),
            ScriptedOutcome::SubmitError(_) | ScriptedOutcome::Hang => {
                return Err(Self::unknown(handle));
            }
        };
        Ok(result)
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<bool, ExecutionError> {
        let mut execution = self
            .executions
            .get_mut(&handle.id)
            .ok_or_else(|| Self::unknown(handle))?;
        if execution.status(self.latency).is_terminal() {
            return Ok(true);
        }
        execution.cancelled = true;
        self.mark_finished(&mut execution);
        self.cancelled.lock().push(execution.step.clone());
        Ok(true)
    }

    async fn cleanup(&self, handle: &ExecutionHandle) -> Result<(), ExecutionError> {
        if let Some((_, mut execution)) = self.executions.remove(&handle.id) {
            self.mark_finished(&mut execution);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Step;
    use pretty_assertions::assert_eq;

    fn descriptor(step: &str) -> StepDescriptor {
        StepDescriptor::from_step(
            &Step::new(step, "true").with_output("out"),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_scripts_are_consumed_in_order() {
        let backend = ScriptedBackend::new()
            .with_latency(Duration::ZERO)
            .script("a", [ScriptedOutcome::Exit(3)]);
        let env = ExecutionEnv::new(Uuid::nil(), Uuid::nil(), 1);

        let first = backend
            .submit(&descriptor("a"), &ResolvedInputs::new(), &env)
            .await
            .unwrap();
        assert_eq!(backend.poll(&first).await.unwrap(), ExecutionStatus::Failed);
        let result = backend.fetch_result(&first).await.unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert!(result.error.is_none());

        let second = backend
            .submit(&descriptor("a"), &ResolvedInputs::new(), &env)
            .await
            .unwrap();
        let result = backend.fetch_result(&second).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.outputs[0].payload, ArtifactPayload::text("a:out:attempt1"));
        assert_eq!(backend.attempts_of("a"), 2);
    }

    #[tokio::test]
    async fn test_hang_until_cancelled() {
        let backend = ScriptedBackend::new().script("slow", [ScriptedOutcome::Hang]);
        let env = ExecutionEnv::new(Uuid::nil(), Uuid::nil(), 1);
        let handle = backend
            .submit(&descriptor("slow"), &ResolvedInputs::new(), &env)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.poll(&handle).await.unwrap(), ExecutionStatus::Running);
        assert_eq!(backend.max_in_flight(), 1);

        assert!(backend.cancel(&handle).await.unwrap());
        assert_eq!(backend.poll(&handle).await.unwrap(), ExecutionStatus::Cancelled);
        assert_eq!(backend.cancelled_steps(), vec!["slow"]);
    }

    #[tokio::test]
    async fn test_submit_error() {
        let backend = ScriptedBackend::new().script(
            "a",
            [ScriptedOutcome::SubmitError(ExecutionError::backend_unavailable("down"))],
        );
        let env = ExecutionEnv::new(Uuid::nil(), Uuid::nil(), 1);
        let err = backend
            .submit(&descriptor("a"), &ResolvedInputs::new(), &env)
            .await
            .unwrap_err();
        assert_eq!(err.reason, FailureReason::BackendUnavailable);
        assert_eq!(backend.max_in_flight(), 0);
    }
}
