//! Core domain model types for runwright.
//!
//! This module contains the value types shared by every other module:
//! - Run and step-run status enums with their transition tables
//! - Artifact records and lineage links
//! - Engine lifecycle and failure events

mod artifact;
mod event;
mod status;

pub use artifact::{Artifact, ArtifactKey, ArtifactPayload, ArtifactUsage, UsageRole};
pub use event::{EngineEvent, FailureEvent};
pub use status::{PipelineRunStatus, StepRunStatus};
