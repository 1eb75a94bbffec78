//! Pipeline run records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{PipelineRunStatus, StepRunStatus};
use crate::errors::TransitionError;
use crate::utils::{elapsed_ms, new_id, now_utc, Timestamp};

/// One execution instance of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    id: Uuid,
    pipeline_id: Uuid,
    status: PipelineRunStatus,
    worker: Option<String>,
    created_at: Timestamp,
    started_at: Option<Timestamp>,
    completed_at: Option<Timestamp>,
    cancel_reason: Option<String>,
    error: Option<String>,
    revision: u64,
}

impl PipelineRun {
    /// Creates a pending run.
    #[must_use]
    pub fn new(pipeline_id: Uuid) -> Self {
        Self {
            id: new_id(),
            pipeline_id,
            status: PipelineRunStatus::Pending,
            worker: None,
            created_at: now_utc(),
            started_at: None,
            completed_at: None,
            cancel_reason: None,
            error: None,
            revision: 0,
        }
    }

    /// Run id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The pipeline being executed.
    #[must_use]
    pub fn pipeline_id(&self) -> Uuid {
        self.pipeline_id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PipelineRunStatus {
        self.status
    }

    /// Worker the run is bound to, once started.
    #[must_use]
    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    /// When the run was created.
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// When the run started.
    #[must_use]
    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    /// When the run reached a terminal status.
    #[must_use]
    pub fn completed_at(&self) -> Option<Timestamp> {
        self.completed_at
    }

    /// Why the run was cancelled.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    /// Diagnostic set when the run was aborted by an engine fault.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Optimistic concurrency revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Wall time between start and completion.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(elapsed_ms(&start, &end)),
            _ => None,
        }
    }

    fn transition(&mut self, next: PipelineRunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::new("pipeline_run", self.id, self.status, next));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(now_utc());
        }
        self.revision += 1;
        Ok(())
    }

    /// `pending → running`, binding the run to `worker`.
    ///
    /// # Errors
    ///
    /// Returns an error unless the run is pending.
    pub fn start(&mut self, worker: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(PipelineRunStatus::Running)?;
        self.started_at = Some(now_utc());
        self.worker = Some(worker.into());
        Ok(())
    }

    /// `running → completed | failed`.
    ///
    /// # Errors
    ///
    /// Returns an error if `status` is not reachable from the current state.
    pub fn finish(&mut self, status: PipelineRunStatus) -> Result<(), TransitionError> {
        self.transition(status)
    }

    /// `{pending, running} → cancelled`.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is already terminal.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(PipelineRunStatus::Cancelled)?;
        self.cancel_reason = Some(reason.into());
        Ok(())
    }

    /// `running → failed` after an engine fault, keeping the diagnostic.
    ///
    /// # Errors
    ///
    /// Returns an error unless the run is running.
    pub fn abort(&mut self, diagnostic: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(PipelineRunStatus::Failed)?;
        self.error = Some(diagnostic.into());
        Ok(())
    }

    /// The terminal status a run should take given its step statuses.
    ///
    /// Returns `None` while any step run is still pending or running.
    /// `cancelled` means cancellation reached the run before its step runs
    /// settled. Cancellation wins over failure; failure wins over completion.
    #[must_use]
    pub fn aggregate_status(
        step_statuses: impl IntoIterator<Item = StepRunStatus>,
        cancelled: bool,
    ) -> Option<PipelineRunStatus> {
        let mut any_failed = false;
        for status in step_statuses {
            if !status.is_terminal() {
                return None;
            }
            any_failed |= status == StepRunStatus::Failed;
        }
        Some(if cancelled {
            PipelineRunStatus::Cancelled
        } else if any_failed {
            PipelineRunStatus::Failed
        } else {
            PipelineRunStatus::Completed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StepRunStatus::{Cancelled, Completed, Failed, Pending, Running, Skipped};

    #[test]
    fn test_lifecycle() {
        let mut run = PipelineRun::new(Uuid::nil());
        assert_eq!(run.status(), PipelineRunStatus::Pending);
        run.start("local").unwrap();
        assert_eq!(run.worker(), Some("local"));
        assert!(run.started_at().is_some());
        run.finish(PipelineRunStatus::Completed).unwrap();
        assert!(run.completed_at().is_some());
        assert!(run.duration_ms().is_some());
        assert_eq!(run.revision(), 2);
    }

    #[test]
    fn test_terminal_runs_are_frozen() {
        let mut run = PipelineRun::new(Uuid::nil());
        run.start("local").unwrap();
        run.finish(PipelineRunStatus::Failed).unwrap();
        assert!(run.cancel("late").is_err());
        assert!(run.finish(PipelineRunStatus::Completed).is_err());
    }

    #[test]
    fn test_cannot_finish_pending() {
        let mut run = PipelineRun::new(Uuid::nil());
        assert!(run.finish(PipelineRunStatus::Completed).is_err());
        run.cancel("before start").unwrap();
        assert_eq!(run.cancel_reason(), Some("before start"));
    }

    #[test]
    fn test_abort_records_diagnostic() {
        let mut run = PipelineRun::new(Uuid::nil());
        run.start("local").unwrap();
        run.abort("dispatched 'b' before 'a'").unwrap();
        assert_eq!(run.status(), PipelineRunStatus::Failed);
        assert_eq!(run.error(), Some("dispatched 'b' before 'a'"));
    }

    #[test]
    fn test_aggregate_status() {
        assert_eq!(PipelineRun::aggregate_status([Completed, Running], false), None);
        assert_eq!(PipelineRun::aggregate_status([Pending], true), None);
        assert_eq!(
            PipelineRun::aggregate_status([Completed, Skipped], false),
            Some(PipelineRunStatus::Completed)
        );
        assert_eq!(
            PipelineRun::aggregate_status([Completed, Failed, Skipped], false),
            Some(PipelineRunStatus::Failed)
        );
        assert_eq!(
            PipelineRun::aggregate_status([Completed, Cancelled, Failed], true),
            Some(PipelineRunStatus::Cancelled)
        );
    }
}
