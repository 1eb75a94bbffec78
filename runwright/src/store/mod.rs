//! Persistence collaborator contract.
//!
//! The engine owns every record; a store only persists what it is handed.
//! Implementations must make [`RunStore::create_run`] atomic and reject
//! stale writes in [`RunStore::update_run`] and [`RunStore::update_step_run`].

mod memory;

pub use memory::InMemoryRunStore;

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::Artifact;
use crate::errors::StoreError;
use crate::pipeline::Pipeline;
use crate::state::{PipelineRun, StepRun};

/// Durable storage for pipelines, runs, step runs and artifacts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persists a validated pipeline.
    async fn save_pipeline(&self, pipeline: Arc<Pipeline>) -> Result<(), StoreError>;

    /// Loads a pipeline.
    async fn get_pipeline(&self, id: Uuid) -> Result<Arc<Pipeline>, StoreError>;

    /// Lists pipelines in creation order.
    async fn list_pipelines(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Arc<Pipeline>>, StoreError>;

    /// Persists a run together with all of its step runs, or nothing.
    async fn create_run(&self, run: &PipelineRun, step_runs: &[StepRun])
        -> Result<(), StoreError>;

    /// Loads a run.
    async fn get_run(&self, id: Uuid) -> Result<PipelineRun, StoreError>;

    /// Lists runs newest first, optionally for one pipeline.
    async fn list_runs(
        &self,
        pipeline_id: Option<Uuid>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PipelineRun>, StoreError>;

    /// Replaces a run if `run.revision()` is newer than the stored one.
    async fn update_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Loads a step run.
    async fn get_step_run(&self, id: Uuid) -> Result<StepRun, StoreError>;

    /// Step runs of a run, in step declaration order.
    async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError>;

    /// Replaces a step run if `step_run.revision()` is newer than the stored one.
    async fn update_step_run(&self, step_run: &StepRun) -> Result<(), StoreError>;

    /// Persists artifact metadata.
    async fn save_artifact(&self, artifact: &Artifact) -> Result<(), StoreError>;

    /// Artifacts of a run, in write order.
    async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>, StoreError>;
}
