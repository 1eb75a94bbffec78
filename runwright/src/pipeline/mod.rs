//! Pipeline definitions and graph validation.
//!
//! This module provides:
//! - Step, dependency and pipeline definitions
//! - The dependency graph validator and its topological order

mod graph;
mod spec;

pub use graph::{validate, DependencyGraph, TopologicalOrder};
pub use spec::{
    is_valid_name, CommandDescriptor, InputRef, Pipeline, PipelineDefinition, Step,
    StepDependency,
};
