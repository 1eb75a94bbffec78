//! Event sink trait and implementations.

use async_trait::async_trait;
use tracing::{debug, info, trace, warn, Level};

use crate::core::EngineEvent;

/// Receives lifecycle events from the scheduler.
///
/// Sinks observe; they never influence engine state, and a slow or broken
/// sink must not stall a run.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &EngineEvent);

    /// Emits an event without blocking. Must never panic.
    fn try_emit(&self, event: &EngineEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &EngineEvent) {}

    fn try_emit(&self, _event: &EngineEvent) {}
}

/// Renders events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Info-level sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event: &EngineEvent) {
        let event_type = event.event_type();
        let run_id = event.pipeline_run_id();
        let step = event.step().unwrap_or("-");
        let data = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => format!("<unserializable: {e}>"),
        };
        match self.level {
            Level::TRACE => trace!(event_type, %run_id, step, event_data = %data, "Event: {event_type}"),
            Level::DEBUG => debug!(event_type, %run_id, step, event_data = %data, "Event: {event_type}"),
            Level::WARN | Level::ERROR => {
                warn!(event_type, %run_id, step, event_data = %data, "Event: {event_type}");
            }
            _ => info!(event_type, %run_id, step, event_data = %data, "Event: {event_type}"),
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &EngineEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &EngineEvent) {
        self.log_event(event);
    }
}

/// Keeps every event in memory. Intended for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<EngineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops every collected event.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose type starts with `type_prefix`, e.g. `"step."`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Step names of `step.dispatched` events, in order.
    #[must_use]
    pub fn dispatched_steps(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::StepDispatched { step, .. } => Some(step.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &EngineEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &EngineEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineRunStatus;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn dispatched(step: &str) -> EngineEvent {
        EngineEvent::StepDispatched {
            pipeline_run_id: Uuid::nil(),
            step_run_id: Uuid::nil(),
            step: step.to_string(),
            attempt: 1,
        }
    }

    fn finished() -> EngineEvent {
        EngineEvent::RunFinished {
            pipeline_run_id: Uuid::nil(),
            status: PipelineRunStatus::Completed,
            duration_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit(&finished()).await;
        NoOpEventSink.try_emit(&finished());
        let sink = LoggingEventSink::debug();
        sink.emit(&dispatched("a")).await;
        sink.try_emit(&finished());
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&dispatched("a")).await;
        sink.try_emit(&dispatched("b"));
        sink.emit(&finished()).await;

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.dispatched_steps(), vec!["a", "b"]);
        assert_eq!(sink.events_of_type("step.").len(), 2);
        assert_eq!(sink.events_of_type("run.").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }
}
