//! Failure classification and retry backoff policy.
//!
//! Transient failures (the adapter could not launch the pipeline, or the
//! run hit a momentary resource shortage) are re-enqueued with backoff
//! until the retry budget is spent. Everything else is terminal.

use std::time::Duration;

/// How an execution failure should be treated by the retry manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth another attempt: launch failures, momentary resource
    /// shortages.
    Transient,
    /// Terminal: bad input, timeouts, missing output artifacts.
    Permanent,
}

/// Exponential backoff schedule for transient retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for the doubled delays.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `retry_count + 1`: doubles with each
    /// retry, capped at `max_delay`.
    pub fn backoff(&self, retry_count: u16) -> Duration {
        let factor = 2u32.saturating_pow(u32::from(retry_count.min(16)));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// True when the failure is transient and the retry budget allows
/// another attempt.
pub fn should_retry(kind: FailureKind, retry_count: u16, max_retries: u16) -> bool {
    kind == FailureKind::Transient && retry_count < max_retries
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
