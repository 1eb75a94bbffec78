//! Test assertions for run snapshots.

use crate::core::{PipelineRunStatus, StepRunStatus};
use crate::scheduler::RunSnapshot;

/// Asserts the run ended with `expected`.
///
/// # Panics
///
/// Panics if the status differs.
pub fn assert_run_status(snapshot: &RunSnapshot, expected: PipelineRunStatus) {
    assert_eq!(
        snapshot.status(),
        expected,
        "Expected run status {:?}, got {:?} (error: {:?})",
        expected,
        snapshot.status(),
        snapshot.run.error()
    );
}

/// Asserts the step run for `step` has status `expected`.
///
/// # Panics
///
/// Panics if the step is unknown or its status differs.
pub fn assert_step_status(snapshot: &RunSnapshot, step: &str, expected: StepRunStatus) {
    let Some(step_run) = snapshot.step_run(step) else {
        panic!(
            "Expected step '{}' in run, steps: {:?}",
            step,
            snapshot
                .step_runs
                .iter()
                .map(|s| s.step_name())
                .collect::<Vec<_>>()
        );
    };
    assert_eq!(
        step_run.status(),
        expected,
        "Expected step '{}' to be {:?}, got {:?}",
        step,
        expected,
        step_run.status()
    );
}

/// Asserts every step run of the run has status `expected`.
///
/// # Panics
///
/// Panics on the first step with a different status.
pub fn assert_all_steps(snapshot: &RunSnapshot, expected: StepRunStatus) {
    for step_run in &snapshot.step_runs {
        assert_step_status(snapshot, step_run.step_name(), expected);
    }
}

/// Asserts `first` appears before `second` in a dispatch log.
///
/// # Panics
///
/// Panics if either step was never dispatched or the order is reversed.
pub fn assert_dispatched_before(dispatched: &[String], first: &str, second: &str) {
    let position = |step: &str| dispatched.iter().position(|s| s == step);
    match (position(first), position(second)) {
        (Some(a), Some(b)) => assert!(
            a < b,
            "Expected '{first}' to be dispatched before '{second}', got {dispatched:?}"
        ),
        _ => panic!("Expected both '{first}' and '{second}' to be dispatched, got {dispatched:?}"),
    }
}
