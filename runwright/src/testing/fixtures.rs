//! Test fixtures for run-level tests.

use std::sync::Arc;

use super::ScriptedBackend;
use crate::backend::{ExecutionBackend, WorkerPool};
use crate::config::{ConfigError, EngineConfig};
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::events::{CollectingEventSink, CollectingNotifier, EventSink, FailureNotifier};
use crate::pipeline::{PipelineDefinition, Step};
use crate::policy::RetryConfig;
use crate::scheduler::{RunSnapshot, Scheduler};
use crate::store::{InMemoryRunStore, RunStore};

/// Configuration with short polls and backoff so runs finish quickly.
#[must_use]
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_retry(
            RetryConfig::new()
                .with_base_delay_ms(5)
                .with_max_delay_ms(20),
        )
        .with_poll_interval_ms(2)
}

/// `a -> b -> c ...`: each step produces `out` and consumes its
/// predecessor's `out`.
#[must_use]
pub fn chain_pipeline(name: &str, steps: &[&str]) -> PipelineDefinition {
    let mut definition = PipelineDefinition::new(name);
    let mut previous: Option<&str> = None;
    for step in steps {
        let mut spec = Step::new(*step, format!("run {step}")).with_output("out");
        if let Some(upstream) = previous {
            spec = spec.with_input(format!("{upstream}/out"));
        }
        definition = definition.step(spec);
        if let Some(upstream) = previous {
            definition = definition.dependency(*step, upstream);
        }
        previous = Some(step);
    }
    definition
}

/// `root` fanned out to each branch, every branch depending only on `root`.
#[must_use]
pub fn fan_out_pipeline(name: &str, branches: &[&str]) -> PipelineDefinition {
    let mut definition =
        PipelineDefinition::new(name).step(Step::new("root", "run root").with_output("seed"));
    for branch in branches {
        definition = definition
            .step(Step::new(*branch, format!("run {branch}")).with_input("seed"))
            .dependency(*branch, "root");
    }
    definition
}

/// An engine wired to a scripted backend and collecting collaborators.
pub struct TestFixture {
    /// The scripted backend behind the single worker `w1`.
    pub backend: Arc<ScriptedBackend>,
    /// The store the engine persists to.
    pub store: Arc<InMemoryRunStore>,
    /// Every event the scheduler emitted.
    pub events: Arc<CollectingEventSink>,
    /// Every failure notification.
    pub notifier: Arc<CollectingNotifier>,
    /// The engine under test.
    pub engine: Engine,
}

impl std::fmt::Debug for TestFixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestFixture")
            .field("events", &self.events.len())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl TestFixture {
    /// A fixture with [`fast_config`].
    pub fn new(backend: ScriptedBackend) -> Result<Self, ConfigError> {
        Self::with_config(backend, fast_config())
    }

    /// A fixture with a custom configuration.
    ///
    /// # Errors
    ///
    /// Fails if `config` does not validate.
    pub fn with_config(
        backend: ScriptedBackend,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        let backend = Arc::new(backend);
        let store = Arc::new(InMemoryRunStore::new());
        let events = Arc::new(CollectingEventSink::new());
        let notifier = Arc::new(CollectingNotifier::new());

        let dyn_backend: Arc<dyn ExecutionBackend> = backend.clone();
        let dyn_store: Arc<dyn RunStore> = store.clone();
        let dyn_sink: Arc<dyn EventSink> = events.clone();
        let dyn_notifier: Arc<dyn FailureNotifier> = notifier.clone();

        let workers = Arc::new(WorkerPool::single("w1", dyn_backend));
        let scheduler = Scheduler::new(config, dyn_store, workers)?
            .with_event_sink(dyn_sink)
            .with_notifier(dyn_notifier);

        Ok(Self {
            backend,
            store,
            events,
            notifier,
            engine: Engine::new(scheduler),
        })
    }

    /// Creates the pipeline, triggers one run and waits for it to finish.
    pub async fn run(&self, definition: PipelineDefinition) -> Result<RunSnapshot, EngineError> {
        let pipeline = self.engine.create_pipeline(definition).await?;
        self.engine.trigger_run(pipeline.id()).await?.wait().await
    }
}
