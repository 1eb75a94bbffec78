//! # Runwright
//!
//! A DAG pipeline execution engine.
//!
//! Runwright takes pipelines of steps connected by dependency edges and
//! drives each run to completion:
//!
//! - **Validation**: definitions are checked for dangling edges and cycles
//!   before they are stored, and again before every run
//! - **Scheduling**: steps are dispatched as soon as their dependencies
//!   complete, with optional per-run concurrency caps
//! - **Retries**: transient failures are retried with backoff; business
//!   failures fail the step immediately
//! - **Artifacts**: outputs are versioned and routed to downstream inputs
//! - **Cancellation**: runs can be cancelled at any point
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use runwright::prelude::*;
//!
//! let engine = Engine::local(EngineConfig::default(), "/var/lib/runwright")?;
//! let pipeline = engine
//!     .create_pipeline(
//!         PipelineDefinition::new("etl")
//!             .step(Step::new("extract", "./extract.sh").with_output("rows"))
//!             .step(Step::new("load", "./load.sh").with_input("rows"))
//!             .dependency("load", "extract"),
//!     )
//!     .await?;
//!
//! let snapshot = engine.trigger_run(pipeline.id()).await?.wait().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod backend;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod policy;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{ArtifactRegistry, ResolvedInputs};
    #[cfg(feature = "local-backend")]
    pub use crate::backend::LocalProcessBackend;
    pub use crate::backend::{
        DeclaredOutput, ExecutionBackend, ExecutionEnv, ExecutionHandle, ExecutionResult,
        ExecutionStatus, StepDescriptor, WorkerPool, WorkerStatus,
    };
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::EngineConfig;
    pub use crate::core::{
        Artifact, ArtifactKey, ArtifactPayload, EngineEvent, FailureEvent, PipelineRunStatus,
        StepRunStatus,
    };
    pub use crate::engine::Engine;
    pub use crate::errors::{
        EngineError, ErrorClass, ExecutionError, FailureReason, GraphError, StoreError,
    };
    pub use crate::events::{EventSink, FailureNotifier, LoggingEventSink, LoggingNotifier};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{Pipeline, PipelineDefinition, Step};
    pub use crate::policy::{BackoffStrategy, JitterStrategy, RetryConfig, RetryPolicy};
    pub use crate::scheduler::{RunHandle, RunSnapshot, Scheduler};
    pub use crate::state::{PipelineRun, StepRun};
    pub use crate::store::{InMemoryRunStore, RunStore};
    pub use crate::utils::{new_id, Timestamp};
}
