//! Engine facade used by the surrounding API layer.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::backend::WorkerPool;
use crate::config::{ConfigError, EngineConfig};
use crate::errors::{EngineError, StoreError};
use crate::pipeline::{Pipeline, PipelineDefinition};
use crate::scheduler::{RunHandle, RunSnapshot, Scheduler};
use crate::state::PipelineRun;
use crate::store::{InMemoryRunStore, RunStore};

/// Pipeline and run operations over one [`Scheduler`].
#[derive(Debug)]
pub struct Engine {
    scheduler: Scheduler,
}

fn pipeline_lookup(id: Uuid, err: StoreError) -> EngineError {
    match err {
        StoreError::NotFound { .. } => EngineError::PipelineNotFound(id),
        other => other.into(),
    }
}

fn run_lookup(id: Uuid, err: StoreError) -> EngineError {
    match err {
        StoreError::NotFound { .. } => EngineError::RunNotFound(id),
        other => other.into(),
    }
}

impl Engine {
    /// Wraps a configured scheduler.
    #[must_use]
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// An engine over an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `config` fails validation.
    pub fn in_memory(
        config: EngineConfig,
        workers: Arc<WorkerPool>,
    ) -> Result<Self, ConfigError> {
        let scheduler = Scheduler::new(config, Arc::new(InMemoryRunStore::new()), workers)?;
        Ok(Self::new(scheduler))
    }

    /// An engine running steps as local processes under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `config` fails validation.
    #[cfg(feature = "local-backend")]
    pub fn local(
        config: EngineConfig,
        root: impl Into<std::path::PathBuf>,
    ) -> Result<Self, ConfigError> {
        let backend = Arc::new(crate::backend::LocalProcessBackend::new(root));
        Self::in_memory(config, Arc::new(WorkerPool::single("local", backend)))
    }

    /// The underlying scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn store(&self) -> &Arc<dyn RunStore> {
        self.scheduler.store()
    }

    /// Validates and persists a pipeline definition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Graph`] if the definition is rejected; no
    /// run can ever be created for it.
    pub async fn create_pipeline(
        &self,
        definition: PipelineDefinition,
    ) -> Result<Arc<Pipeline>, EngineError> {
        let pipeline = Pipeline::from_definition(definition)?.into_shared();
        self.store().save_pipeline(Arc::clone(&pipeline)).await?;
        info!(
            pipeline_id = %pipeline.id(),
            pipeline = %pipeline.name(),
            steps = pipeline.step_count(),
            "Pipeline created"
        );
        Ok(pipeline)
    }

    /// Loads a pipeline.
    pub async fn get_pipeline(&self, id: Uuid) -> Result<Arc<Pipeline>, EngineError> {
        self.store()
            .get_pipeline(id)
            .await
            .map_err(|e| pipeline_lookup(id, e))
    }

    /// Lists pipelines in creation order.
    pub async fn list_pipelines(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Arc<Pipeline>>, EngineError> {
        Ok(self.store().list_pipelines(offset, limit).await?)
    }

    /// Starts a run of a stored pipeline.
    pub async fn trigger_run(&self, pipeline_id: Uuid) -> Result<RunHandle, EngineError> {
        let pipeline = self.get_pipeline(pipeline_id).await?;
        self.scheduler.start_run(pipeline).await
    }

    /// Current persisted state of a run.
    pub async fn get_run(&self, run_id: Uuid) -> Result<RunSnapshot, EngineError> {
        let run = self
            .store()
            .get_run(run_id)
            .await
            .map_err(|e| run_lookup(run_id, e))?;
        let step_runs = self.store().list_step_runs(run_id).await?;
        let artifacts = self.store().list_artifacts(run_id).await?;
        Ok(RunSnapshot {
            run,
            step_runs,
            artifacts,
        })
    }

    /// Lists runs newest first, optionally for one pipeline.
    pub async fn list_runs(
        &self,
        pipeline_id: Option<Uuid>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PipelineRun>, EngineError> {
        Ok(self.store().list_runs(pipeline_id, offset, limit).await?)
    }

    /// Requests cancellation of an active run.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunNotFound`] if the run does not exist.
    /// Cancelling a finished run is a no-op that returns `Ok(false)`.
    pub async fn cancel_run(
        &self,
        run_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<bool, EngineError> {
        if self.scheduler.cancel_run(run_id, reason) {
            return Ok(true);
        }
        self.store()
            .get_run(run_id)
            .await
            .map_err(|e| run_lookup(run_id, e))?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PipelineRunStatus, StepRunStatus};
    use crate::errors::GraphError;
    use crate::pipeline::Step;
    use crate::testing::{fast_config, ScriptedBackend};
    use pretty_assertions::assert_eq;

    fn engine() -> Engine {
        let pool = WorkerPool::single("w1", Arc::new(ScriptedBackend::new()));
        Engine::in_memory(fast_config(), Arc::new(pool)).unwrap()
    }

    fn definition() -> PipelineDefinition {
        PipelineDefinition::new("etl")
            .step(Step::new("extract", "true").with_output("rows"))
            .step(Step::new("load", "true").with_input("rows"))
            .dependency("load", "extract")
    }

    #[tokio::test]
    async fn test_create_and_run_pipeline() {
        let engine = engine();
        let pipeline = engine.create_pipeline(definition()).await.unwrap();
        assert_eq!(engine.list_pipelines(0, 10).await.unwrap().len(), 1);

        let handle = engine.trigger_run(pipeline.id()).await.unwrap();
        let run_id = handle.run_id();
        let finished = handle.wait().await.unwrap();
        assert_eq!(finished.status(), PipelineRunStatus::Completed);

        let stored = engine.get_run(run_id).await.unwrap();
        assert_eq!(stored.status(), PipelineRunStatus::Completed);
        assert_eq!(stored.step_runs.len(), 2);
        assert!(stored
            .step_runs
            .iter()
            .all(|s| s.status() == StepRunStatus::Completed));
        assert_eq!(stored.artifacts.len(), 1);

        let runs = engine.list_runs(Some(pipeline.id()), 0, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(!engine.cancel_run(run_id, "late").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_definition_is_not_stored() {
        let engine = engine();
        let err = engine
            .create_pipeline(
                PipelineDefinition::new("bad")
                    .step(Step::new("a", "true"))
                    .dependency("a", "ghost"),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Graph(GraphError::DanglingDependency { .. })
        ));
        assert!(engine.list_pipelines(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let engine = engine();
        let id = Uuid::now_v7();
        assert!(matches!(
            engine.trigger_run(id).await,
            Err(EngineError::PipelineNotFound(missing)) if missing == id
        ));
        assert!(matches!(
            engine.get_run(id).await,
            Err(EngineError::RunNotFound(_))
        ));
        assert!(matches!(
            engine.cancel_run(id, "nope").await,
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[cfg(feature = "local-backend")]
    #[tokio::test]
    async fn test_local_engine_runs_shell_steps() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::local(fast_config(), dir.path()).unwrap();
        let pipeline = engine
            .create_pipeline(
                PipelineDefinition::new("shell")
                    .step(
                        Step::new("write", "printf hello > \"$RUNWRIGHT_ARTIFACTS_DIR/greeting\"")
                            .with_output("greeting"),
                    )
                    .step(
                        Step::new("read", "grep -q hello \"$RUNWRIGHT_INPUT_GREETING\"")
                            .with_input("greeting"),
                    )
                    .dependency("read", "write"),
            )
            .await
            .unwrap();
        let snapshot = engine
            .trigger_run(pipeline.id())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(snapshot.status(), PipelineRunStatus::Completed);
    }
}
