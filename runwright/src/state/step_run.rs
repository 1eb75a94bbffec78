//! Step run records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::StepRunStatus;
use crate::errors::{ExecutionError, TransitionError};
use crate::utils::{new_id, now_utc, Timestamp};

/// Metadata keys written by the engine.
pub mod keys {
    /// Worker the step ran on.
    pub const WORKER: &str = "worker";
    /// Exit code of the last attempt.
    pub const EXIT_CODE: &str = "exit_code";
    /// Wall time of the last attempt.
    pub const DURATION_MS: &str = "duration_ms";
    /// Error class of the last failed attempt.
    pub const ERROR_CLASS: &str = "error_class";
    /// Failure reason of the last failed attempt.
    pub const ERROR_REASON: &str = "error_reason";
    /// Error message of the last failed attempt.
    pub const ERROR_MESSAGE: &str = "error_message";
    /// Errors of attempts that were retried.
    pub const ATTEMPT_ERRORS: &str = "attempt_errors";
    /// Why the step was skipped.
    pub const SKIP_REASON: &str = "skip_reason";
    /// Why the step was cancelled.
    pub const CANCEL_REASON: &str = "cancel_reason";
}

/// Permission to move a failed step run back to pending.
///
/// Only the retry policy can issue one, which keeps `failed → pending`
/// from being reachable anywhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTicket {
    step_run_id: Uuid,
    retry_count: u32,
}

impl RetryTicket {
    pub(crate) fn issue(step_run_id: Uuid, retry_count: u32) -> Self {
        Self {
            step_run_id,
            retry_count,
        }
    }

    /// The step run the ticket is for.
    #[must_use]
    pub fn step_run_id(&self) -> Uuid {
        self.step_run_id
    }

    /// The retry count the step run will have after requeueing.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

/// The execution record for one step within one pipeline run.
///
/// Every mutation bumps `revision`, which the store uses for optimistic
/// concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    id: Uuid,
    pipeline_run_id: Uuid,
    step_name: String,
    status: StepRunStatus,
    logs: String,
    metadata: HashMap<String, Value>,
    started_at: Option<Timestamp>,
    completed_at: Option<Timestamp>,
    retry_count: u32,
    revision: u64,
}

impl StepRun {
    /// Creates a pending step run.
    #[must_use]
    pub fn new(pipeline_run_id: Uuid, step_name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            pipeline_run_id,
            step_name: step_name.into(),
            status: StepRunStatus::Pending,
            logs: String::new(),
            metadata: HashMap::new(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            revision: 0,
        }
    }

    /// Step run id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Owning run id.
    #[must_use]
    pub fn pipeline_run_id(&self) -> Uuid {
        self.pipeline_run_id
    }

    /// Step name.
    #[must_use]
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> StepRunStatus {
        self.status
    }

    /// Accumulated logs from every attempt.
    #[must_use]
    pub fn logs(&self) -> &str {
        &self.logs
    }

    /// Execution metadata.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Metadata entry by key.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// When the first attempt started.
    #[must_use]
    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    /// When the step run reached its current terminal state.
    #[must_use]
    pub fn completed_at(&self) -> Option<Timestamp> {
        self.completed_at
    }

    /// Number of retries performed so far.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// The 1-based number of the current (or next) attempt.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Optimistic concurrency revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Returns true if the step run is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: StepRunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::new("step_run", self.id, self.status, next));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(now_utc());
        }
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    /// `pending → running`. Writes the attempt header to the logs.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step run is pending.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(StepRunStatus::Running)?;
        self.started_at.get_or_insert_with(now_utc);
        let header = format!("--- attempt {} ---\n", self.attempt());
        self.logs.push_str(&header);
        Ok(())
    }

    /// `running → completed`.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step run is running.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(StepRunStatus::Completed)
    }

    /// `running → failed`, recording the error in metadata.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step run is running.
    pub fn fail(&mut self, error: &ExecutionError) -> Result<(), TransitionError> {
        self.transition(StepRunStatus::Failed)?;
        self.metadata
            .insert(keys::ERROR_CLASS.into(), Value::String(error.class.to_string()));
        self.metadata
            .insert(keys::ERROR_REASON.into(), Value::String(error.reason.to_string()));
        self.metadata
            .insert(keys::ERROR_MESSAGE.into(), Value::String(error.message.clone()));
        Ok(())
    }

    /// `pending → skipped`.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step run is pending.
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(StepRunStatus::Skipped)?;
        self.metadata
            .insert(keys::SKIP_REASON.into(), Value::String(reason.into()));
        Ok(())
    }

    /// `{pending, running} → cancelled`.
    ///
    /// # Errors
    ///
    /// Returns an error if the step run is already terminal.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(StepRunStatus::Cancelled)?;
        self.metadata
            .insert(keys::CANCEL_REASON.into(), Value::String(reason.into()));
        Ok(())
    }

    /// `failed → pending` under a retry ticket.
    ///
    /// The failed attempt's error moves into the `attempt_errors` history and
    /// the retry counter is incremented; logs are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the step run is not failed or the ticket was
    /// issued for a different step run or attempt.
    pub fn requeue(&mut self, ticket: RetryTicket) -> Result<(), TransitionError> {
        let valid = self.status == StepRunStatus::Failed
            && ticket.step_run_id == self.id
            && ticket.retry_count == self.retry_count + 1;
        if !valid {
            return Err(TransitionError::new(
                "step_run",
                self.id,
                self.status,
                StepRunStatus::Pending,
            ));
        }

        let mut record = serde_json::Map::new();
        record.insert("attempt".into(), Value::from(self.attempt()));
        for key in [keys::ERROR_CLASS, keys::ERROR_REASON, keys::ERROR_MESSAGE] {
            if let Some(value) = self.metadata.remove(key) {
                record.insert(key.into(), value);
            }
        }
        let history = self
            .metadata
            .entry(keys::ATTEMPT_ERRORS.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = history {
            items.push(Value::Object(record));
        }

        self.status = StepRunStatus::Pending;
        self.retry_count = ticket.retry_count;
        self.completed_at = None;
        self.touch();
        Ok(())
    }

    /// Appends text to the logs, adding a trailing newline if missing.
    pub fn append_logs(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.logs.push_str(text);
        if !text.ends_with('\n') {
            self.logs.push('\n');
        }
        self.touch();
    }

    /// Sets a metadata entry.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
        self.touch();
    }

    /// Merges backend-reported metadata.
    pub fn merge_metadata(&mut self, entries: HashMap<String, Value>) {
        if entries.is_empty() {
            return;
        }
        self.metadata.extend(entries);
        self.touch();
    }
}
