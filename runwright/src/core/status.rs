//! Run and step-run status enums and their transition tables.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The status of a pipeline run.
///
/// `pending → running → {completed, failed, cancelled}`; a pending run may
/// also be cancelled before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunStatus {
    /// Created, not yet executing.
    #[default]
    Pending,
    /// The coordinator is dispatching steps.
    Running,
    /// Every step completed, or was skipped without any failure.
    Completed,
    /// At least one step failed terminally.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl fmt::Display for PipelineRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl PipelineRunStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the transition `self → next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Cancelled)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

/// The status of a step run.
///
/// `pending → running → {completed, failed}`, plus `pending → skipped`
/// for cascading skips and `{pending, running} → cancelled` for run
/// cancellation. `failed → pending` is only reachable through a retry
/// ticket (see [`crate::state::StepRun::requeue`]) and is therefore not part
/// of [`StepRunStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    /// Waiting for dependencies or a retry slot.
    #[default]
    Pending,
    /// Submitted to the execution backend.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed; terminal unless a retry ticket re-queues it.
    Failed,
    /// Not executed because an upstream step did not complete.
    Skipped,
    /// Not finished because the run was cancelled.
    Cancelled,
}

impl fmt::Display for StepRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl StepRunStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Returns true if dependents of a step in this status may run.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns true if dependents of a step in this status must be skipped.
    #[must_use]
    pub fn blocks_dependents(self) -> bool {
        matches!(self, Self::Failed | Self::Skipped | Self::Cancelled)
    }

    /// Returns true if the transition `self → next` is allowed without a
    /// retry ticket.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Skipped | Self::Cancelled)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_display() {
        assert_eq!(PipelineRunStatus::Pending.to_string(), "pending");
        assert_eq!(PipelineRunStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(StepRunStatus::Skipped.to_string(), "skipped");
    }

    #[test]
    fn test_run_status_transitions() {
        use PipelineRunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_step_status_transitions() {
        use StepRunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Skipped));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Skipped.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn test_step_status_terminal() {
        assert!(StepRunStatus::Completed.is_terminal());
        assert!(StepRunStatus::Failed.is_terminal());
        assert!(StepRunStatus::Skipped.is_terminal());
        assert!(!StepRunStatus::Pending.is_terminal());
        assert!(!StepRunStatus::Running.is_terminal());
    }

    #[test]
    fn test_step_status_serialize() {
        let json = serde_json::to_string(&StepRunStatus::Completed).unwrap();
        assert_eq!(json, r#""completed""#);
        let back: StepRunStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StepRunStatus::Completed);
    }
}
