//! Engine lifecycle events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::PipelineRunStatus;
use crate::errors::{ErrorClass, ExecutionError, FailureReason};
use crate::utils::{now_utc, Timestamp};

/// Payload handed to the notification collaborator when a step fails
/// terminally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEvent {
    /// The run the step belongs to.
    pub pipeline_run_id: Uuid,
    /// The failed step run.
    pub step_run_id: Uuid,
    /// Step name.
    pub step: String,
    /// Error class of the final attempt.
    pub error_kind: ErrorClass,
    /// Failure cause of the final attempt.
    pub reason: FailureReason,
    /// Human readable detail.
    pub message: String,
    /// Number of attempts made, including the last.
    pub attempts: u32,
    /// When the failure became terminal.
    pub occurred_at: Timestamp,
}

impl FailureEvent {
    /// Creates a failure event from the final execution error.
    #[must_use]
    pub fn new(
        pipeline_run_id: Uuid,
        step_run_id: Uuid,
        step: impl Into<String>,
        error: &ExecutionError,
        attempts: u32,
    ) -> Self {
        Self {
            pipeline_run_id,
            step_run_id,
            step: step.into(),
            error_kind: error.class,
            reason: error.reason,
            message: error.message.clone(),
            attempts,
            occurred_at: now_utc(),
        }
    }
}

/// An event emitted by the scheduler while coordinating a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The run was seeded and the coordinator started.
    RunStarted {
        /// Run id.
        pipeline_run_id: Uuid,
        /// Pipeline id.
        pipeline_id: Uuid,
        /// Worker the run is bound to.
        worker: String,
        /// Number of step runs seeded.
        step_count: usize,
    },
    /// A step attempt was handed to the backend.
    StepDispatched {
        /// Run id.
        pipeline_run_id: Uuid,
        /// Step run id.
        step_run_id: Uuid,
        /// Step name.
        step: String,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A step completed and its outputs were recorded.
    StepCompleted {
        /// Run id.
        pipeline_run_id: Uuid,
        /// Step run id.
        step_run_id: Uuid,
        /// Step name.
        step: String,
        /// Wall time of the successful attempt.
        duration_ms: u64,
        /// Names of the artifacts it produced.
        artifacts: Vec<String>,
    },
    /// A failed attempt will be retried after a delay.
    StepRetryScheduled {
        /// Run id.
        pipeline_run_id: Uuid,
        /// Step run id.
        step_run_id: Uuid,
        /// Step name.
        step: String,
        /// The attempt that will run next.
        next_attempt: u32,
        /// Backoff before it is dispatched.
        delay_ms: u64,
        /// Why the previous attempt failed.
        reason: FailureReason,
    },
    /// A step failed terminally.
    StepFailed(FailureEvent),
    /// A step was skipped because an upstream step did not complete.
    StepSkipped {
        /// Run id.
        pipeline_run_id: Uuid,
        /// Step run id.
        step_run_id: Uuid,
        /// Step name.
        step: String,
        /// The upstream step that caused the skip.
        blocked_by: String,
    },
    /// A step was cancelled with its run.
    StepCancelled {
        /// Run id.
        pipeline_run_id: Uuid,
        /// Step run id.
        step_run_id: Uuid,
        /// Step name.
        step: String,
        /// Cancellation reason.
        reason: String,
    },
    /// The run reached a terminal status.
    RunFinished {
        /// Run id.
        pipeline_run_id: Uuid,
        /// Final status.
        status: PipelineRunStatus,
        /// Wall time of the run.
        duration_ms: u64,
    },
}

impl EngineEvent {
    /// Dotted event name, e.g. `step.failed`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run.started",
            Self::StepDispatched { .. } => "step.dispatched",
            Self::StepCompleted { .. } => "step.completed",
            Self::StepRetryScheduled { .. } => "step.retry_scheduled",
            Self::StepFailed(_) => "step.failed",
            Self::StepSkipped { .. } => "step.skipped",
            Self::StepCancelled { .. } => "step.cancelled",
            Self::RunFinished { .. } => "run.finished",
        }
    }

    /// The run this event belongs to.
    #[must_use]
    pub fn pipeline_run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { pipeline_run_id, .. }
            | Self::StepDispatched { pipeline_run_id, .. }
            | Self::StepCompleted { pipeline_run_id, .. }
            | Self::StepRetryScheduled { pipeline_run_id, .. }
            | Self::StepSkipped { pipeline_run_id, .. }
            | Self::StepCancelled { pipeline_run_id, .. }
            | Self::RunFinished { pipeline_run_id, .. } => *pipeline_run_id,
            Self::StepFailed(failure) => failure.pipeline_run_id,
        }
    }

    /// The step this event is about, if any.
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepDispatched { step, .. }
            | Self::StepCompleted { step, .. }
            | Self::StepRetryScheduled { step, .. }
            | Self::StepSkipped { step, .. }
            | Self::StepCancelled { step, .. } => Some(step),
            Self::StepFailed(failure) => Some(&failure.step),
            Self::RunStarted { .. } | Self::RunFinished { .. } => None,
        }
    }
}
