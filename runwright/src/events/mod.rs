//! Event emission and failure notification.
//!
//! Sinks are injected into the [`Scheduler`](crate::scheduler::Scheduler);
//! there is no process-wide sink.

mod notifier;
mod sink;

pub use notifier::{CollectingNotifier, FailureNotifier, LoggingNotifier, NoOpNotifier};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
