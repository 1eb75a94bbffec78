//! Failure classification and retry decisions.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

use super::retry::RetryConfig;
use crate::errors::{ExecutionError, FailureReason};
use crate::pipeline::Pipeline;
use crate::state::{RetryTicket, StepRun};

/// Why a failure is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// Business-class errors are never retried.
    NotRetryable,
    /// The retry budget is used up.
    Exhausted {
        /// Attempts made, including the last.
        attempts: u32,
    },
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Requeue the step run with `ticket` once `delay` has passed.
    Retry {
        /// Backoff before the next attempt.
        delay: Duration,
        /// Permission to move the step run back to pending.
        ticket: RetryTicket,
    },
    /// Leave the step run failed.
    Terminal {
        /// Why.
        reason: TerminalReason,
    },
}

impl FailureDecision {
    /// Returns true for [`FailureDecision::Retry`].
    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Retry policy for one pipeline run.
///
/// Holds the engine-wide budget, per-step overrides and the previous delay
/// of each step run (for decorrelated jitter).
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    step_budgets: HashMap<String, u32>,
    business_exit_codes: HashSet<i32>,
    previous_delays: Mutex<HashMap<Uuid, u64>>,
}

impl RetryPolicy {
    /// Creates a policy from the engine retry config.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        let business_exit_codes = config.business_exit_codes.iter().copied().collect();
        Self {
            config,
            step_budgets: HashMap::new(),
            business_exit_codes,
            previous_delays: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a policy honouring each step's `max_attempts` override.
    #[must_use]
    pub fn for_pipeline(config: RetryConfig, pipeline: &Pipeline) -> Self {
        pipeline
            .steps()
            .iter()
            .filter_map(|step| step.max_attempts.map(|n| (step.name.clone(), n)))
            .fold(Self::new(config), |policy, (name, n)| {
                policy.with_step_budget(name, n)
            })
    }

    /// Overrides the budget for one step.
    #[must_use]
    pub fn with_step_budget(mut self, step: impl Into<String>, max_attempts: u32) -> Self {
        self.step_budgets.insert(step.into(), max_attempts);
        self
    }

    /// The retry config.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Maximum attempts allowed for `step`.
    #[must_use]
    pub fn max_attempts(&self, step: &str) -> u32 {
        self.step_budgets
            .get(step)
            .copied()
            .unwrap_or(self.config.max_attempts)
            .max(1)
    }

    /// Decides between retry and terminal failure for a failed attempt.
    ///
    /// Only application-class errors are retried, and only while
    /// `retry_count + 1 < max_attempts`.
    #[must_use]
    pub fn on_step_failure(&self, step_run: &StepRun, error: &ExecutionError) -> FailureDecision {
        if !error.is_retryable() {
            self.forget(step_run.id());
            return FailureDecision::Terminal {
                reason: TerminalReason::NotRetryable,
            };
        }

        let attempts = step_run.attempt();
        if attempts >= self.max_attempts(step_run.step_name()) {
            self.forget(step_run.id());
            return FailureDecision::Terminal {
                reason: TerminalReason::Exhausted { attempts },
            };
        }

        let retry = step_run.retry_count();
        let delay = {
            let mut previous = self.previous_delays.lock();
            let delay = self
                .config
                .delay_for(retry, previous.get(&step_run.id()).copied());
            previous.insert(step_run.id(), u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
            delay
        };

        FailureDecision::Retry {
            delay,
            ticket: RetryTicket::issue(step_run.id(), retry + 1),
        }
    }

    /// Classifies a non-zero exit that the backend did not classify itself.
    ///
    /// `None` means the process was terminated by a signal, which is treated
    /// as transient. Codes listed in `business_exit_codes` are business-class;
    /// every other code is application-class.
    #[must_use]
    pub fn classify_exit(&self, exit_code: Option<i32>) -> ExecutionError {
        match exit_code {
            None => ExecutionError::application(
                FailureReason::Signal,
                "Process terminated by signal",
            ),
            Some(code) if self.business_exit_codes.contains(&code) => ExecutionError::business(
                FailureReason::NonZeroExit,
                format!("Process exited with code {code}"),
            ),
            Some(code) => ExecutionError::application(
                FailureReason::NonZeroExit,
                format!("Process exited with code {code}"),
            ),
        }
    }

    fn forget(&self, step_run_id: Uuid) {
        self.previous_delays.lock().remove(&step_run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorClass;
    use crate::pipeline::{PipelineDefinition, Step};
    use pretty_assertions::assert_eq;

    fn failed_step_run(retries: u32) -> StepRun {
        let mut step_run = StepRun::new(Uuid::nil(), "b");
        let err = ExecutionError::application(FailureReason::Timeout, "slow");
        for n in 1..=retries {
            step_run.start().unwrap();
            step_run.fail(&err).unwrap();
            step_run.requeue(RetryTicket::issue(step_run.id(), n)).unwrap();
        }
        step_run.start().unwrap();
        step_run.fail(&err).unwrap();
        step_run
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::new().with_base_delay_ms(10))
    }

    #[test]
    fn test_business_errors_never_retry() {
        let step_run = failed_step_run(0);
        let err = ExecutionError::business(FailureReason::InvalidInput, "bad");
        assert_eq!(
            policy().on_step_failure(&step_run, &err),
            FailureDecision::Terminal {
                reason: TerminalReason::NotRetryable
            }
        );
    }

    #[test]
    fn test_application_errors_retry_until_budget() {
        let policy = policy();
        let err = ExecutionError::application(FailureReason::Timeout, "slow");

        match policy.on_step_failure(&failed_step_run(0), &err) {
            FailureDecision::Retry { delay, ticket } => {
                assert_eq!(delay, Duration::from_millis(10));
                assert_eq!(ticket.retry_count(), 1);
            }
            other => panic!("expected retry, got {other:?}"),
        }

        match policy.on_step_failure(&failed_step_run(1), &err) {
            FailureDecision::Retry { delay, ticket } => {
                assert_eq!(delay, Duration::from_millis(20));
                assert_eq!(ticket.retry_count(), 2);
            }
            other => panic!("expected retry, got {other:?}"),
        }

        assert_eq!(
            policy.on_step_failure(&failed_step_run(2), &err),
            FailureDecision::Terminal {
                reason: TerminalReason::Exhausted { attempts: 3 }
            }
        );
    }

    #[test]
    fn test_step_budget_override() {
        let pipeline = PipelineDefinition::new("p")
            .step(Step::new("b", "true").with_max_attempts(1))
            .build()
            .unwrap();
        let policy = RetryPolicy::for_pipeline(RetryConfig::default(), &pipeline);
        assert_eq!(policy.max_attempts("b"), 1);
        assert_eq!(policy.max_attempts("other"), 3);

        let err = ExecutionError::application(FailureReason::Timeout, "slow");
        assert!(!policy.on_step_failure(&failed_step_run(0), &err).is_retry());
    }

    #[test]
    fn test_classify_exit() {
        let policy = RetryPolicy::new(RetryConfig::new().with_business_exit_code(65));
        let err = policy.classify_exit(Some(65));
        assert_eq!(err.class, ErrorClass::Business);
        assert_eq!(err.reason, FailureReason::NonZeroExit);

        assert_eq!(policy.classify_exit(Some(1)).class, ErrorClass::Application);
        assert_eq!(policy.classify_exit(None).reason, FailureReason::Signal);
    }
}
