//! Authoritative run and step-run state.
//!
//! Both records only change through guarded transition methods; an illegal
//! transition returns a [`crate::errors::TransitionError`] and leaves the
//! record untouched.

mod pipeline_run;
mod step_run;

pub use pipeline_run::PipelineRun;
pub use step_run::{keys as metadata_keys, RetryTicket, StepRun};
