//! Run-scoped execution context.

use std::sync::Arc;
use uuid::Uuid;

use crate::backend::{ExecutionBackend, WorkerLease};
use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::pipeline::Pipeline;
use crate::policy::RetryPolicy;

/// Everything a coordinator needs about the run it drives.
///
/// The worker binding is chosen once when the run starts and every step
/// run of the run executes through it.
#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    pipeline: Arc<Pipeline>,
    lease: WorkerLease,
    policy: RetryPolicy,
    token: Arc<CancellationToken>,
    config: Arc<EngineConfig>,
}

impl RunContext {
    pub(crate) fn new(
        run_id: Uuid,
        pipeline: Arc<Pipeline>,
        lease: WorkerLease,
        token: Arc<CancellationToken>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let policy = RetryPolicy::for_pipeline(config.retry.clone(), &pipeline);
        Self {
            run_id,
            pipeline,
            lease,
            policy,
            token,
            config,
        }
    }

    /// The run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The pipeline being executed.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Name of the bound worker.
    #[must_use]
    pub fn worker(&self) -> &str {
        self.lease.name()
    }

    /// The bound backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        self.lease.backend()
    }

    /// Retry policy with the pipeline's per-step budgets applied.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The run's cancellation token.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
