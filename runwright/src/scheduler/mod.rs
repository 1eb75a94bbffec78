//! Run scheduling.
//!
//! [`Scheduler::start_run`] seeds a run atomically, binds it to one worker
//! and hands it to a dedicated coordinator task. The only process-wide
//! state is the index of active runs used to route cancellation.

mod context;
mod coordinator;

pub use context::RunContext;

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use self::coordinator::{Collaborators, RunCoordinator};
use crate::artifacts::ArtifactRegistry;
use crate::backend::WorkerPool;
use crate::cancellation::CancellationToken;
use crate::config::{ConfigError, EngineConfig};
use crate::core::{Artifact, PipelineRunStatus};
use crate::errors::EngineError;
use crate::events::{EventSink, FailureNotifier, NoOpEventSink, NoOpNotifier};
use crate::pipeline::Pipeline;
use crate::state::{metadata_keys, PipelineRun, StepRun};
use crate::store::RunStore;

/// Full state of a run: the run record, its step runs in declaration
/// order and every artifact it produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    /// The run record.
    pub run: PipelineRun,
    /// Step runs in step declaration order.
    pub step_runs: Vec<StepRun>,
    /// Artifacts produced by the run.
    pub artifacts: Vec<Artifact>,
}

impl RunSnapshot {
    /// Run status.
    #[must_use]
    pub fn status(&self) -> PipelineRunStatus {
        self.run.status()
    }

    /// The step run for `step`.
    #[must_use]
    pub fn step_run(&self, step: &str) -> Option<&StepRun> {
        self.step_runs.iter().find(|s| s.step_name() == step)
    }
}

type ActiveRuns = DashMap<Uuid, Arc<CancellationToken>>;

/// Membership of one run in the active index, released on drop.
///
/// The coordinator holds the guard and releases it once no further
/// cancellation can affect the run. Dropping it on unwind keeps a panicked
/// coordinator from leaving a stale entry behind.
pub(crate) struct ActiveRunGuard {
    active: Arc<ActiveRuns>,
    run_id: Uuid,
}

impl ActiveRunGuard {
    fn register(active: &Arc<ActiveRuns>, run_id: Uuid, token: Arc<CancellationToken>) -> Self {
        active.insert(run_id, token);
        Self {
            active: Arc::clone(active),
            run_id,
        }
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

/// A started run.
#[derive(Debug)]
pub struct RunHandle {
    run: PipelineRun,
    join: JoinHandle<RunSnapshot>,
}

impl RunHandle {
    /// Run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run.id()
    }

    /// The run record as it was when the run started.
    #[must_use]
    pub fn run(&self) -> &PipelineRun {
        &self.run
    }

    /// Waits for the run to reach a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] if the coordinator task died.
    pub async fn wait(self) -> Result<RunSnapshot, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::Internal(format!("Run coordinator failed: {e}")))
    }
}

/// Starts runs and routes cancellation to them.
pub struct Scheduler {
    config: Arc<EngineConfig>,
    workers: Arc<WorkerPool>,
    collaborators: Collaborators,
    active: Arc<ActiveRuns>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("workers", &self.workers)
            .field("active_runs", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler with no-op event sink and notifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `config` fails validation.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RunStore>,
        workers: Arc<WorkerPool>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            workers,
            collaborators: Collaborators {
                store,
                registry: Arc::new(ArtifactRegistry::new()),
                sink: Arc::new(NoOpEventSink),
                notifier: Arc::new(NoOpNotifier),
            },
            active: Arc::new(DashMap::new()),
        })
    }

    /// Uses a shared artifact registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ArtifactRegistry>) -> Self {
        self.collaborators.registry = registry;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.collaborators.sink = sink;
        self
    }

    /// Sets the failure notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.collaborators.notifier = notifier;
        self
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The artifact registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ArtifactRegistry> {
        &self.collaborators.registry
    }

    /// The persistence collaborator.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.collaborators.store
    }

    /// The worker pool.
    #[must_use]
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// Starts a run of `pipeline`.
    ///
    /// The graph is re-validated, a worker is bound, and the run is persisted
    /// together with one pending step run per step before anything executes.
    /// Once this returns, failures surface only as run and step state.
    ///
    /// # Errors
    ///
    /// Fails if the graph is invalid, no worker is available, or the store
    /// rejects the seeded run. Nothing is persisted in those cases.
    pub async fn start_run(&self, pipeline: Arc<Pipeline>) -> Result<RunHandle, EngineError> {
        pipeline.revalidate()?;
        let lease = self
            .workers
            .select_for_run(self.config.preferred_worker.as_deref())?;

        let mut run = PipelineRun::new(pipeline.id());
        run.start(lease.name())?;
        let step_runs: Vec<StepRun> = pipeline
            .steps()
            .iter()
            .map(|step| {
                let mut step_run = StepRun::new(run.id(), step.name.clone());
                step_run.set_metadata(metadata_keys::WORKER, lease.name());
                step_run
            })
            .collect();
        self.collaborators.store.create_run(&run, &step_runs).await?;

        let run_id = run.id();
        let token = Arc::new(CancellationToken::new());
        let registration = ActiveRunGuard::register(&self.active, run_id, Arc::clone(&token));

        let span = info_span!(
            "pipeline_run",
            run_id = %run_id,
            pipeline = %pipeline.name(),
            worker = %lease.name()
        );
        let ctx = RunContext::new(run_id, pipeline, lease, token, Arc::clone(&self.config));
        let coordinator = RunCoordinator::new(
            ctx,
            self.collaborators.clone(),
            run.clone(),
            step_runs,
            registration,
        );
        let join = tokio::spawn(coordinator.run().instrument(span));

        Ok(RunHandle { run, join })
    }

    /// Requests cancellation of an active run.
    ///
    /// Returns false if the run is unknown or every step run has already
    /// settled, even while the run is still delivering failure
    /// notifications.
    pub fn cancel_run(&self, run_id: Uuid, reason: impl Into<String>) -> bool {
        let Some(token) = self.active.get(&run_id).map(|t| Arc::clone(t.value())) else {
            return false;
        };
        let reason = reason.into();
        if token.cancel(reason.clone()) {
            info!(run_id = %run_id, reason = %reason, "Run cancellation requested");
        }
        true
    }

    /// Ids of runs whose coordinator is still active.
    #[must_use]
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    /// Returns true if `run_id` is still being coordinated.
    #[must_use]
    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.active.contains_key(&run_id)
    }
}
