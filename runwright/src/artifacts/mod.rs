//! Artifact registry.
//!
//! Artifacts are append-only: a `(run, step, name, version)` key is written
//! once. Inputs are resolved per dependency step run, never by name across
//! the whole run.

mod registry;

pub use registry::{ArtifactRegistry, ResolvedInputs, CONTENT_SHA256};
