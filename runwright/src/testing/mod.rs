//! Testing utilities for runwright pipelines.
//!
//! This module provides:
//! - A scripted execution backend
//! - An engine fixture with collecting collaborators
//! - Assertions over run snapshots

mod assertions;
mod backend;
mod fixtures;

pub use assertions::{
    assert_all_steps, assert_dispatched_before, assert_run_status, assert_step_status,
};
pub use backend::{Dispatch, ScriptedBackend, ScriptedOutcome};
pub use fixtures::{chain_pipeline, fan_out_pipeline, fast_config, TestFixture};
