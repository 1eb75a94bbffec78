//! Retry and failure policy.
//!
//! This module provides:
//! - Retry budget and backoff/jitter configuration
//! - The per-run retry policy deciding retry vs. terminal failure
//! - Exit-code classification

mod decision;
mod retry;

pub use decision::{FailureDecision, RetryPolicy, TerminalReason};
pub use retry::{BackoffStrategy, JitterStrategy, RetryConfig};
