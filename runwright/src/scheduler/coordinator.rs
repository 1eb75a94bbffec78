//! Single-writer coordinator for one pipeline run.
//!
//! The coordinator owns every step run record of its run. Step attempts and
//! retry backoffs run as spawned tasks that report back over one completion
//! channel. The coordinator's only suspension point is "await the next
//! completion or cancellation", so readiness is never computed by two
//! completions at once.

use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::context::RunContext;
use super::{ActiveRunGuard, RunSnapshot};
use crate::artifacts::{ArtifactRegistry, ResolvedInputs};
use crate::backend::{
    DeclaredOutput, ExecutionBackend, ExecutionEnv, ExecutionHandle, ExecutionResult,
    ExecutionStatus, StepDescriptor,
};
use crate::cancellation::CancellationToken;
use crate::core::{EngineEvent, FailureEvent, PipelineRunStatus, StepRunStatus};
use crate::errors::{ArtifactError, ExecutionError, FailureReason, SchedulerInvariantError, TransitionError};
use crate::events::{EventSink, FailureNotifier};
use crate::observability::SpanTimer;
use crate::policy::FailureDecision;
use crate::state::{metadata_keys, PipelineRun, StepRun};
use crate::store::RunStore;

/// Shared collaborators handed to every coordinator.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub store: Arc<dyn RunStore>,
    pub registry: Arc<ArtifactRegistry>,
    pub sink: Arc<dyn EventSink>,
    pub notifier: Arc<dyn FailureNotifier>,
}

enum TaskEvent {
    AttemptFinished { idx: usize, report: AttemptReport },
    RetryDue { idx: usize },
}

enum AttemptOutcome {
    Succeeded(Vec<DeclaredOutput>),
    /// `None` means the backend reported an exit without classifying it.
    Failed(Option<ExecutionError>),
    Cancelled,
}

struct AttemptReport {
    duration_ms: u64,
    exit_code: Option<i32>,
    logs: String,
    metadata: HashMap<String, Value>,
    outcome: AttemptOutcome,
}

impl AttemptReport {
    fn failed(error: ExecutionError) -> Self {
        Self {
            duration_ms: 0,
            exit_code: None,
            logs: String::new(),
            metadata: HashMap::new(),
            outcome: AttemptOutcome::Failed(Some(error)),
        }
    }

    fn cancelled() -> Self {
        Self {
            outcome: AttemptOutcome::Cancelled,
            ..Self::failed(ExecutionError::application(FailureReason::Other, "cancelled"))
        }
    }

    fn from_result(result: ExecutionResult, run_cancelled: bool) -> Self {
        let outcome = match result.status {
            ExecutionStatus::Completed => AttemptOutcome::Succeeded(result.outputs),
            ExecutionStatus::Failed => AttemptOutcome::Failed(result.error),
            ExecutionStatus::Cancelled if run_cancelled => AttemptOutcome::Cancelled,
            ExecutionStatus::Cancelled => AttemptOutcome::Failed(Some(result.error.unwrap_or_else(|| {
                ExecutionError::backend_unavailable("Execution was cancelled by the backend")
            }))),
            status @ (ExecutionStatus::Pending | ExecutionStatus::Running) => {
                AttemptOutcome::Failed(Some(ExecutionError::backend_unavailable(format!(
                    "Backend returned a result for an unfinished execution ({status:?})"
                ))))
            }
        };
        Self {
            duration_ms: 0,
            exit_code: result.exit_code,
            logs: result.logs,
            metadata: result.metadata,
            outcome,
        }
    }
}

enum WaitEnd {
    Finished,
    Cancelled,
}

/// Drives one run from seeded step runs to a terminal run status.
pub(crate) struct RunCoordinator {
    ctx: RunContext,
    collaborators: Collaborators,
    run: PipelineRun,
    step_runs: Vec<StepRun>,
    completions_tx: mpsc::UnboundedSender<TaskEvent>,
    completions_rx: mpsc::UnboundedReceiver<TaskEvent>,
    running: HashSet<usize>,
    backing_off: HashSet<usize>,
    cancel_handled: bool,
    notifications: Vec<JoinHandle<()>>,
    registration: Option<ActiveRunGuard>,
}

fn violation(run_id: Uuid, step: &str, err: &TransitionError) -> SchedulerInvariantError {
    SchedulerInvariantError::new(run_id, err.to_string())
        .with_step(step)
        .with_context("from", err.from.clone())
        .with_context("to", err.to.clone())
}

fn input_error(err: &ArtifactError) -> ExecutionError {
    let reason = match err {
        ArtifactError::MissingInput { .. } | ArtifactError::ProducerNotDependency { .. } => {
            FailureReason::MissingInput
        }
        _ => FailureReason::InvalidInput,
    };
    ExecutionError::business(reason, err.to_string())
}

impl RunCoordinator {
    /// `step_runs` must be in step declaration order.
    pub(crate) fn new(
        ctx: RunContext,
        collaborators: Collaborators,
        run: PipelineRun,
        step_runs: Vec<StepRun>,
        registration: ActiveRunGuard,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            collaborators,
            run,
            step_runs,
            completions_tx,
            completions_rx,
            running: HashSet::new(),
            backing_off: HashSet::new(),
            cancel_handled: false,
            notifications: Vec::new(),
            registration: Some(registration),
        }
    }

    /// Runs to completion and returns the final state.
    pub(crate) async fn run(mut self) -> RunSnapshot {
        self.emit(EngineEvent::RunStarted {
            pipeline_run_id: self.ctx.run_id(),
            pipeline_id: self.ctx.pipeline().id(),
            worker: self.ctx.worker().to_string(),
            step_count: self.step_runs.len(),
        })
        .await;
        info!(
            run_id = %self.ctx.run_id(),
            pipeline = %self.ctx.pipeline().name(),
            worker = %self.ctx.worker(),
            "Pipeline run started"
        );

        if let Err(violation) = self.drive().await {
            self.abort(&violation).await;
        }
        // Every step run has settled; later cancels must not reach this run.
        drop(self.registration.take());
        self.finish().await
    }

    async fn drive(&mut self) -> Result<(), SchedulerInvariantError> {
        let token = Arc::clone(self.ctx.token());
        loop {
            if self.all_terminal() {
                return Ok(());
            }
            if token.is_cancelled() {
                if !self.cancel_handled {
                    self.handle_cancel().await?;
                }
            } else {
                self.dispatch_ready().await?;
            }

            if self.all_terminal() {
                return Ok(());
            }
            if self.running.is_empty() && self.backing_off.is_empty() {
                let pending: Vec<&str> = self
                    .step_runs
                    .iter()
                    .filter(|s| !s.is_terminal())
                    .map(StepRun::step_name)
                    .collect();
                return Err(SchedulerInvariantError::new(
                    self.ctx.run_id(),
                    "Run has unfinished steps but nothing in flight",
                )
                .with_context("unfinished", pending.join(",")));
            }

            let watch_cancel = !self.cancel_handled;
            let next = tokio::select! {
                () = token.cancelled(), if watch_cancel => None,
                event = self.completions_rx.recv() => event,
            };
            if let Some(event) = next {
                self.handle_event(event).await?;
            }
        }
    }

    fn all_terminal(&self) -> bool {
        self.step_runs.iter().all(StepRun::is_terminal)
    }

    fn cancel_reason(&self) -> String {
        self.ctx
            .token()
            .reason()
            .unwrap_or_else(|| "Run cancelled".to_string())
    }

    async fn handle_event(&mut self, event: TaskEvent) -> Result<(), SchedulerInvariantError> {
        match event {
            TaskEvent::RetryDue { idx } => {
                self.backing_off.remove(&idx);
                debug!(step = %self.step_runs[idx].step_name(), "Retry backoff elapsed");
                Ok(())
            }
            TaskEvent::AttemptFinished { idx, report } => {
                self.running.remove(&idx);
                self.record_attempt(idx, report).await
            }
        }
    }

    async fn handle_cancel(&mut self) -> Result<(), SchedulerInvariantError> {
        self.cancel_handled = true;
        let reason = self.cancel_reason();
        info!(run_id = %self.ctx.run_id(), reason = %reason, "Cancelling run");
        for idx in 0..self.step_runs.len() {
            if self.step_runs[idx].status() == StepRunStatus::Pending {
                self.backing_off.remove(&idx);
                self.cancel_step(idx, &reason).await?;
            }
        }
        Ok(())
    }

    /// Dispatches every ready step, in declaration order, up to the cap.
    async fn dispatch_ready(&mut self) -> Result<(), SchedulerInvariantError> {
        let pipeline = Arc::clone(self.ctx.pipeline());
        let graph = pipeline.graph();
        let cap = self.ctx.config().max_parallel_steps;

        for idx in 0..self.step_runs.len() {
            if self.step_runs[idx].status() != StepRunStatus::Pending
                || self.backing_off.contains(&idx)
                || self.running.contains(&idx)
            {
                continue;
            }

            let deps = graph.dependencies(idx);
            if let Some(&blocker) = deps
                .iter()
                .find(|&&d| self.step_runs[d].status().blocks_dependents())
            {
                self.skip_step(idx, graph.name(blocker)).await?;
                self.skip_dependents(idx).await?;
                continue;
            }
            if !deps
                .iter()
                .all(|&d| self.step_runs[d].status() == StepRunStatus::Completed)
            {
                continue;
            }
            if cap.is_some_and(|cap| self.running.len() >= cap) {
                break;
            }
            self.dispatch(idx).await?;
        }
        Ok(())
    }

    fn ensure_dispatchable(&self, idx: usize) -> Result<(), SchedulerInvariantError> {
        let graph = self.ctx.pipeline().graph();
        let step_run = &self.step_runs[idx];
        let unsatisfied: Vec<String> = graph
            .dependencies(idx)
            .iter()
            .filter(|&&d| self.step_runs[d].status() != StepRunStatus::Completed)
            .map(|&d| format!("{}={}", graph.name(d), self.step_runs[d].status()))
            .collect();

        if step_run.status() == StepRunStatus::Pending
            && !self.running.contains(&idx)
            && unsatisfied.is_empty()
        {
            return Ok(());
        }
        Err(SchedulerInvariantError::new(
            self.ctx.run_id(),
            "Step dispatched before it was ready",
        )
        .with_step(step_run.step_name())
        .with_context("status", step_run.status().to_string())
        .with_context("unsatisfied", unsatisfied.join(",")))
    }

    async fn dispatch(&mut self, idx: usize) -> Result<(), SchedulerInvariantError> {
        self.ensure_dispatchable(idx)?;
        let run_id = self.ctx.run_id();
        let pipeline = Arc::clone(self.ctx.pipeline());
        let step = &pipeline.steps()[idx];

        self.step_runs[idx]
            .start()
            .map_err(|e| violation(run_id, &step.name, &e))?;
        self.persist_step_run(idx).await;

        let resolved = {
            let deps: Vec<&StepRun> = pipeline
                .graph()
                .dependencies(idx)
                .iter()
                .map(|&d| &self.step_runs[d])
                .collect();
            self.collaborators
                .registry
                .resolve_inputs(step, &self.step_runs[idx], &deps)
        };
        let inputs = match resolved {
            Ok(inputs) => inputs,
            Err(err) => {
                warn!(run_id = %run_id, step = %step.name, error = %err, "Input resolution failed");
                return self.on_failure(idx, input_error(&err)).await;
            }
        };

        let step_run = &self.step_runs[idx];
        let attempt = step_run.attempt();
        self.emit(EngineEvent::StepDispatched {
            pipeline_run_id: run_id,
            step_run_id: step_run.id(),
            step: step.name.clone(),
            attempt,
        })
        .await;
        info!(
            run_id = %run_id,
            step = %step.name,
            step_run_id = %step_run.id(),
            attempt,
            inputs = inputs.len(),
            "Dispatching step"
        );

        let config = self.ctx.config();
        let descriptor = StepDescriptor::from_step(step, config.default_step_timeout());
        let env = ExecutionEnv::new(run_id, step_run.id(), attempt).with_vars(config.env.clone());
        let attempt_task = execute_attempt(
            Arc::clone(self.ctx.backend()),
            descriptor,
            inputs,
            env,
            config.poll_interval(),
            Arc::clone(self.ctx.token()),
        );
        let completions = self.completions_tx.clone();
        tokio::spawn(
            async move {
                let report = match AssertUnwindSafe(attempt_task).catch_unwind().await {
                    Ok(report) => report,
                    Err(_) => AttemptReport::failed(ExecutionError::application(
                        FailureReason::Other,
                        "Step task panicked",
                    )),
                };
                // The receiver is gone only if the run already finished.
                let _ = completions.send(TaskEvent::AttemptFinished { idx, report });
            }
            .in_current_span(),
        );
        self.running.insert(idx);
        Ok(())
    }

    async fn record_attempt(
        &mut self,
        idx: usize,
        report: AttemptReport,
    ) -> Result<(), SchedulerInvariantError> {
        let AttemptReport {
            duration_ms,
            exit_code,
            logs,
            metadata,
            outcome,
        } = report;

        let step_run = &mut self.step_runs[idx];
        if !logs.is_empty() {
            step_run.append_logs(&logs);
        }
        step_run.merge_metadata(metadata);
        step_run.set_metadata(metadata_keys::DURATION_MS, duration_ms);
        step_run.set_metadata(metadata_keys::EXIT_CODE, exit_code);

        match outcome {
            AttemptOutcome::Succeeded(outputs) => self.on_success(idx, outputs, duration_ms).await,
            AttemptOutcome::Failed(error) => {
                let error = error.unwrap_or_else(|| self.ctx.policy().classify_exit(exit_code));
                self.on_failure(idx, error).await
            }
            AttemptOutcome::Cancelled => {
                let reason = self.cancel_reason();
                self.cancel_step(idx, &reason).await
            }
        }
    }

    async fn on_success(
        &mut self,
        idx: usize,
        outputs: Vec<DeclaredOutput>,
        duration_ms: u64,
    ) -> Result<(), SchedulerInvariantError> {
        let run_id = self.ctx.run_id();
        let pipeline = Arc::clone(self.ctx.pipeline());
        let step = &pipeline.steps()[idx];

        let mut produced = Vec::with_capacity(outputs.len());
        for output in outputs {
            if !step.outputs.contains(&output.name) {
                warn!(run_id = %run_id, step = %step.name, output = %output.name, "Ignoring undeclared output");
                continue;
            }
            match self.collaborators.registry.put(
                &self.step_runs[idx],
                &output.name,
                output.payload,
                output.metadata,
            ) {
                Ok(artifact) => produced.push(artifact),
                Err(err) => {
                    let error = ExecutionError::business(FailureReason::LogicViolation, err.to_string());
                    return self.on_failure(idx, error).await;
                }
            }
        }
        for missing in step
            .outputs
            .iter()
            .filter(|name| !produced.iter().any(|a| a.name() == name.as_str()))
        {
            warn!(run_id = %run_id, step = %step.name, output = %missing, "Declared output was not produced");
        }
        for artifact in &produced {
            if let Err(err) = self.collaborators.store.save_artifact(artifact).await {
                warn!(run_id = %run_id, artifact = %artifact.key, error = %err, "Failed to persist artifact");
            }
        }

        self.step_runs[idx]
            .complete()
            .map_err(|e| violation(run_id, &step.name, &e))?;
        self.persist_step_run(idx).await;
        info!(run_id = %run_id, step = %step.name, duration_ms, "Step completed");

        self.emit(EngineEvent::StepCompleted {
            pipeline_run_id: run_id,
            step_run_id: self.step_runs[idx].id(),
            step: step.name.clone(),
            duration_ms,
            artifacts: produced.iter().map(|a| a.key.to_string()).collect(),
        })
        .await;
        Ok(())
    }

    async fn on_failure(
        &mut self,
        idx: usize,
        error: ExecutionError,
    ) -> Result<(), SchedulerInvariantError> {
        if self.ctx.token().is_cancelled() {
            let reason = self.cancel_reason();
            return self.cancel_step(idx, &reason).await;
        }

        let run_id = self.ctx.run_id();
        let step_run = &mut self.step_runs[idx];
        let step = step_run.step_name().to_string();
        step_run
            .fail(&error)
            .map_err(|e| violation(run_id, &step, &e))?;

        match self.ctx.policy().on_step_failure(step_run, &error) {
            FailureDecision::Retry { delay, ticket } => {
                step_run
                    .requeue(ticket)
                    .map_err(|e| violation(run_id, &step, &e))?;
                let step_run_id = step_run.id();
                let next_attempt = step_run.attempt();
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    run_id = %run_id,
                    step = %step,
                    next_attempt,
                    delay_ms,
                    error = %error,
                    "Step attempt failed, retrying"
                );
                self.persist_step_run(idx).await;
                self.schedule_retry(idx, delay);
                self.emit(EngineEvent::StepRetryScheduled {
                    pipeline_run_id: run_id,
                    step_run_id,
                    step,
                    next_attempt,
                    delay_ms,
                    reason: error.reason,
                })
                .await;
                Ok(())
            }
            FailureDecision::Terminal { reason } => {
                let event = FailureEvent::new(run_id, step_run.id(), &step, &error, step_run.attempt());
                error!(
                    run_id = %run_id,
                    step = %step,
                    attempts = event.attempts,
                    terminal_reason = ?reason,
                    error = %error,
                    "Step failed"
                );
                self.persist_step_run(idx).await;
                self.emit(EngineEvent::StepFailed(event.clone())).await;
                self.notify(event);
                self.skip_dependents(idx).await
            }
        }
    }

    fn schedule_retry(&mut self, idx: usize, delay: Duration) {
        self.backing_off.insert(idx);
        let token = Arc::clone(self.ctx.token());
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = token.cancelled() => {}
            }
            let _ = completions.send(TaskEvent::RetryDue { idx });
        });
    }

    fn notify(&mut self, event: FailureEvent) {
        let notifier = Arc::clone(&self.collaborators.notifier);
        let timeout = self.ctx.config().notify_timeout();
        let delivery = async move {
            match tokio::time::timeout(timeout, notifier.notify(&event)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(step = %event.step, error = %err, "Failure notification failed"),
                Err(_) => warn!(step = %event.step, timeout_secs = timeout.as_secs(), "Failure notification timed out"),
            }
        };
        self.notifications
            .push(tokio::spawn(delivery.in_current_span()));
    }

    async fn skip_dependents(&mut self, idx: usize) -> Result<(), SchedulerInvariantError> {
        let pipeline = Arc::clone(self.ctx.pipeline());
        let graph = pipeline.graph();
        let blocked_by = graph.name(idx);
        for dependent in graph.transitive_dependents(idx) {
            if self.step_runs[dependent].status() == StepRunStatus::Pending
                && !self.running.contains(&dependent)
            {
                self.skip_step(dependent, blocked_by).await?;
            }
        }
        Ok(())
    }

    async fn skip_step(&mut self, idx: usize, blocked_by: &str) -> Result<(), SchedulerInvariantError> {
        let run_id = self.ctx.run_id();
        let step_run = &mut self.step_runs[idx];
        let step = step_run.step_name().to_string();
        step_run
            .skip(format!("Upstream step '{blocked_by}' did not complete"))
            .map_err(|e| violation(run_id, &step, &e))?;
        let step_run_id = step_run.id();
        info!(run_id = %run_id, step = %step, blocked_by, "Step skipped");
        self.persist_step_run(idx).await;
        self.emit(EngineEvent::StepSkipped {
            pipeline_run_id: run_id,
            step_run_id,
            step,
            blocked_by: blocked_by.to_string(),
        })
        .await;
        Ok(())
    }

    async fn cancel_step(&mut self, idx: usize, reason: &str) -> Result<(), SchedulerInvariantError> {
        let run_id = self.ctx.run_id();
        let step_run = &mut self.step_runs[idx];
        let step = step_run.step_name().to_string();
        step_run
            .cancel(reason)
            .map_err(|e| violation(run_id, &step, &e))?;
        let step_run_id = step_run.id();
        self.persist_step_run(idx).await;
        self.emit(EngineEvent::StepCancelled {
            pipeline_run_id: run_id,
            step_run_id,
            step,
            reason: reason.to_string(),
        })
        .await;
        Ok(())
    }

    async fn abort(&mut self, violation: &SchedulerInvariantError) {
        let run_id = self.ctx.run_id();
        error!(
            run_id = %run_id,
            step = ?violation.step,
            context = ?violation.context,
            "Aborting run: {violation}"
        );
        self.ctx
            .token()
            .cancel(format!("Run aborted: {}", violation.message));

        for idx in 0..self.step_runs.len() {
            if self.step_runs[idx].is_terminal() {
                continue;
            }
            if let Err(err) = self.step_runs[idx].cancel("Run aborted after an internal error") {
                error!(run_id = %run_id, error = %err, "Failed to cancel step run during abort");
                continue;
            }
            self.persist_step_run(idx).await;
        }
        if let Err(err) = self.run.abort(violation.to_string()) {
            error!(run_id = %run_id, error = %err, "Failed to abort run");
        }
    }

    async fn finish(mut self) -> RunSnapshot {
        let run_id = self.ctx.run_id();
        for joined in join_all(self.notifications.drain(..)).await {
            if let Err(err) = joined {
                warn!(run_id = %run_id, error = %err, "Notification task failed");
            }
        }

        if !self.run.status().is_terminal() {
            let cancelled = self.cancel_handled
                || self
                    .step_runs
                    .iter()
                    .any(|s| s.status() == StepRunStatus::Cancelled);
            let outcome = match PipelineRun::aggregate_status(
                self.step_runs.iter().map(StepRun::status),
                cancelled,
            ) {
                Some(PipelineRunStatus::Cancelled) => {
                    let reason = self.cancel_reason();
                    self.run.cancel(reason)
                }
                Some(status) => self.run.finish(status),
                None => self.run.abort("Run ended with unfinished steps"),
            };
            if let Err(err) = outcome {
                error!(run_id = %run_id, error = %err, "Failed to finish run");
            }
        }

        if let Err(err) = self.collaborators.store.update_run(&self.run).await {
            warn!(run_id = %run_id, error = %err, "Failed to persist run");
        }
        let status = self.run.status();
        let duration_ms = self.run.duration_ms().unwrap_or(0);
        self.emit(EngineEvent::RunFinished {
            pipeline_run_id: run_id,
            status,
            duration_ms,
        })
        .await;
        info!(run_id = %run_id, status = %status, duration_ms, "Pipeline run finished");

        let artifacts = self
            .collaborators
            .registry
            .artifacts_for_run(run_id)
            .iter()
            .map(|a| a.as_ref().clone())
            .collect();
        RunSnapshot {
            run: self.run,
            step_runs: self.step_runs,
            artifacts,
        }
    }

    async fn persist_step_run(&self, idx: usize) {
        let step_run = &self.step_runs[idx];
        if let Err(err) = self.collaborators.store.update_step_run(step_run).await {
            warn!(
                run_id = %self.ctx.run_id(),
                step = %step_run.step_name(),
                error = %err,
                "Failed to persist step run"
            );
        }
    }

    async fn emit(&self, event: EngineEvent) {
        self.collaborators.sink.emit(&event).await;
    }
}

/// Runs one attempt on the backend: submit, poll until terminal or timeout,
/// fetch the result, clean up.
async fn execute_attempt(
    backend: Arc<dyn ExecutionBackend>,
    descriptor: StepDescriptor,
    inputs: ResolvedInputs,
    env: ExecutionEnv,
    poll_interval: Duration,
    token: Arc<CancellationToken>,
) -> AttemptReport {
    let timer = SpanTimer::start(descriptor.step.clone());

    let mut report = match backend.submit(&descriptor, &inputs, &env).await {
        Ok(handle) => {
            debug!(step = %descriptor.step, execution_id = %handle.id, "Execution submitted");
            let report =
                supervise(backend.as_ref(), &descriptor, &handle, poll_interval, &token).await;
            if let Err(err) = backend.cleanup(&handle).await {
                warn!(execution_id = %handle.id, error = %err, "Execution cleanup failed");
            }
            report
        }
        Err(err) => AttemptReport::failed(err),
    };
    report.duration_ms = timer.finish();
    report
}

async fn supervise(
    backend: &dyn ExecutionBackend,
    descriptor: &StepDescriptor,
    handle: &ExecutionHandle,
    poll_interval: Duration,
    token: &CancellationToken,
) -> AttemptReport {
    let waited = tokio::time::timeout(
        descriptor.timeout,
        wait_for_terminal(backend, handle, poll_interval, token),
    )
    .await;

    match waited {
        Err(_) => {
            warn!(step = %descriptor.step, timeout_ms = descriptor.timeout.as_millis(), "Step timed out");
            cancel_quietly(backend, handle).await;
            AttemptReport::failed(ExecutionError::timeout(descriptor.timeout))
        }
        Ok(Err(err)) => AttemptReport::failed(err),
        Ok(Ok(WaitEnd::Cancelled)) => {
            cancel_quietly(backend, handle).await;
            AttemptReport::cancelled()
        }
        Ok(Ok(WaitEnd::Finished)) => match backend.fetch_result(handle).await {
            Ok(result) => AttemptReport::from_result(result, token.is_cancelled()),
            Err(err) => AttemptReport::failed(err),
        },
    }
}

async fn wait_for_terminal(
    backend: &dyn ExecutionBackend,
    handle: &ExecutionHandle,
    poll_interval: Duration,
    token: &CancellationToken,
) -> Result<WaitEnd, ExecutionError> {
    loop {
        if backend.poll(handle).await?.is_terminal() {
            return Ok(WaitEnd::Finished);
        }
        tokio::select! {
            () = token.cancelled() => return Ok(WaitEnd::Cancelled),
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}

async fn cancel_quietly(backend: &dyn ExecutionBackend, handle: &ExecutionHandle) {
    match backend.cancel(handle).await {
        Ok(true) => {}
        Ok(false) => warn!(execution_id = %handle.id, "Backend could not stop execution"),
        Err(err) => warn!(execution_id = %handle.id, error = %err, "Cancel request failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::super::ActiveRuns;
    use super::*;
    use crate::backend::WorkerPool;
    use crate::config::EngineConfig;
    use crate::events::{CollectingEventSink, NoOpNotifier};
    use crate::store::InMemoryRunStore;
    use crate::testing::{chain_pipeline, fast_config, ScriptedBackend, ScriptedOutcome};
    use pretty_assertions::assert_eq;

    struct Harness {
        backend: Arc<ScriptedBackend>,
        store: Arc<InMemoryRunStore>,
        sink: Arc<CollectingEventSink>,
        active: Arc<ActiveRuns>,
        coordinator: RunCoordinator,
    }

    async fn harness(backend: ScriptedBackend, steps: &[&str], config: EngineConfig) -> Harness {
        let backend = Arc::new(backend);
        let store = Arc::new(InMemoryRunStore::new());
        let sink = Arc::new(CollectingEventSink::new());
        let active = Arc::new(ActiveRuns::new());

        let dyn_backend: Arc<dyn ExecutionBackend> = backend.clone();
        let lease = WorkerPool::single("w1", dyn_backend)
            .select_for_run(None)
            .unwrap();
        let pipeline = chain_pipeline("coordinated", steps)
            .build()
            .unwrap()
            .into_shared();

        let mut run = PipelineRun::new(pipeline.id());
        run.start(lease.name()).unwrap();
        let step_runs: Vec<StepRun> = pipeline
            .steps()
            .iter()
            .map(|step| StepRun::new(run.id(), step.name.clone()))
            .collect();
        store.create_run(&run, &step_runs).await.unwrap();

        let token = Arc::new(CancellationToken::new());
        let registration = ActiveRunGuard::register(&active, run.id(), Arc::clone(&token));
        let ctx = RunContext::new(run.id(), pipeline, lease, token, Arc::new(config));
        let collaborators = Collaborators {
            store: store.clone(),
            registry: Arc::new(ArtifactRegistry::new()),
            sink: sink.clone(),
            notifier: Arc::new(NoOpNotifier),
        };

        Harness {
            backend,
            store,
            sink,
            active,
            coordinator: RunCoordinator::new(ctx, collaborators, run, step_runs, registration),
        }
    }

    fn success_report() -> AttemptReport {
        AttemptReport {
            duration_ms: 1,
            exit_code: Some(0),
            logs: String::new(),
            metadata: HashMap::new(),
            outcome: AttemptOutcome::Succeeded(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_invariant_violation_aborts_run_and_stops_in_flight_steps() {
        let h = harness(
            ScriptedBackend::new().script("a", [ScriptedOutcome::Hang]),
            &["a", "b"],
            fast_config(),
        )
        .await;
        let run_id = h.coordinator.ctx.run_id();

        // A completion for "b", which was never dispatched, while "a" is in flight.
        h.coordinator
            .completions_tx
            .send(TaskEvent::AttemptFinished {
                idx: 1,
                report: success_report(),
            })
            .unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), h.coordinator.run())
            .await
            .unwrap();

        assert_eq!(snapshot.run.status(), PipelineRunStatus::Failed);
        let error = snapshot.run.error().unwrap();
        assert!(error.contains("Scheduler invariant violated"), "{error}");
        assert!(error.contains("'pending' to 'completed'"), "{error}");
        for step_run in &snapshot.step_runs {
            assert_eq!(step_run.status(), StepRunStatus::Cancelled);
        }
        assert!(h.active.is_empty());

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.backend.cancelled_steps().is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.backend.cancelled_steps(), vec!["a"]);
        assert_eq!(h.backend.attempts_of("b"), 0);

        let stored = h.store.get_run(run_id).await.unwrap();
        assert_eq!(stored.status(), PipelineRunStatus::Failed);
        assert_eq!(h.sink.events_of_type("run.finished").len(), 1);
    }

    #[tokio::test]
    async fn test_registration_is_released_before_notifications_finish() {
        let h = harness(
            ScriptedBackend::new().script("a", [ScriptedOutcome::business_failure("bad")]),
            &["a"],
            fast_config(),
        )
        .await;
        let run_id = h.coordinator.ctx.run_id();
        let token = Arc::clone(h.coordinator.ctx.token());
        let mut coordinator = h.coordinator;

        coordinator.drive().await.unwrap();
        drop(coordinator.registration.take());
        assert!(!h.active.contains_key(&run_id));

        // A cancel that lands after every step settled leaves the outcome alone.
        token.cancel("late");
        let snapshot = coordinator.finish().await;
        assert_eq!(snapshot.run.status(), PipelineRunStatus::Failed);
        assert_eq!(snapshot.run.cancel_reason(), None);
    }
}
