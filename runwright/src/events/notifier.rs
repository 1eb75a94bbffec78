//! Out-of-band failure delivery.

use async_trait::async_trait;
use tracing::warn;

use crate::core::FailureEvent;

/// Delivers terminal step failures to an external channel (email, webhook).
///
/// Delivery errors are reported back so the engine can log them; they
/// never change run state.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    /// Delivers one failure.
    async fn notify(&self, event: &FailureEvent) -> anyhow::Result<()>;
}

/// Drops every failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl FailureNotifier for NoOpNotifier {
    async fn notify(&self, _event: &FailureEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs failures at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl FailureNotifier for LoggingNotifier {
    async fn notify(&self, event: &FailureEvent) -> anyhow::Result<()> {
        warn!(
            run_id = %event.pipeline_run_id,
            step_run_id = %event.step_run_id,
            step = %event.step,
            error_kind = %event.error_kind,
            attempts = event.attempts,
            "Step failed: {}",
            event.message
        );
        Ok(())
    }
}

/// Keeps every failure in memory. Intended for tests.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    events: parking_lot::Mutex<Vec<FailureEvent>>,
}

impl CollectingNotifier {
    /// Creates an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Failures delivered so far.
    #[must_use]
    pub fn events(&self) -> Vec<FailureEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl FailureNotifier for CollectingNotifier {
    async fn notify(&self, event: &FailureEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExecutionError;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_collecting_notifier() {
        let notifier = CollectingNotifier::new();
        let error = ExecutionError::business(
            crate::errors::FailureReason::InvalidInput,
            "bad row",
        );
        let event = FailureEvent::new(Uuid::nil(), Uuid::nil(), "load", &error, 1);

        LoggingNotifier.notify(&event).await.unwrap();
        NoOpNotifier.notify(&event).await.unwrap();
        notifier.notify(&event).await.unwrap();

        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].step, "load");
        assert_eq!(events[0].message, "bad row");
    }
}
