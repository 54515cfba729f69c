//! Retry policy — bounded retries with a fixed backoff.

use cadence_core::config::SchedulerConfig;
use chrono::{DateTime, Duration, Utc};

/// Decision after a failed send at the current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try the same stage again at this time.
    RetryAt(DateTime<Utc>),
    /// Retries exhausted; the sequence goes terminal.
    Terminal,
}

/// Bounded-retry policy: up to `max_retries` attempts per stage, each
/// deferred by a fixed backoff. No advancement on failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::seconds(config.retry_backoff_secs as i64),
        }
    }

    /// Decide after a failure, where `retry_count` already counts the
    /// attempt that just failed. `max_retries` comes from the state record
    /// (it may be account-configured), not from this policy's default.
    pub fn on_failure(&self, retry_count: u32, max_retries: u32, now: DateTime<Utc>) -> RetryDecision {
        if retry_count < max_retries {
            RetryDecision::RetryAt(now + self.backoff)
        } else {
            RetryDecision::Terminal
        }
    }
}
