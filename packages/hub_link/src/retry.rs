//! Pluggable connect-retry policies.

use std::time::Duration;

use crate::error::HubError;

/// Failure history handed to a retry policy before each new attempt.
#[derive(Debug)]
pub struct RetryContext<'a> {
    /// Time since the very first attempt, not the most recent one.
    pub elapsed: Duration,
    /// Attempts that have already failed.
    pub previous_attempts: u32,
    /// The most recent failure.
    pub reason: &'a HubError,
}

/// Maps failure history to either a delay before the next attempt or a
/// give-up decision (`None`).
pub trait RetryPolicy: Send + Sync + 'static {
    fn next_delay(&self, ctx: &RetryContext<'_>) -> Option<Duration>;
}

/// Constant delay between attempts, with an optional attempt cap.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl FixedDelay {
    /// Retry forever at a constant interval.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Give up once `max_attempts` attempts have failed.
    pub fn with_max_attempts(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts),
        }
    }
}

impl RetryPolicy for FixedDelay {
    fn next_delay(&self, ctx: &RetryContext<'_>) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if ctx.previous_attempts + 1 >= max => None,
            _ => Some(self.delay),
        }
    }
}

/// Doubling backoff from `base`, capped at `max_delay`, with an optional
/// attempt cap. Defaults to the 1s..60s doubling schedule used for
/// long-lived tunnel reconnects.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, ctx: &RetryContext<'_>) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if ctx.previous_attempts + 1 >= max {
                return None;
            }
        }
        let shift = ctx.previous_attempts.min(6);
        Some(self.base.saturating_mul(1 << shift).min(self.max_delay))
    }
}
