use std::time::Duration;

use crate::error::FetchError;

pub const DEFAULT_TIMEOUT_MS: u64 = 2_500;
pub const DEFAULT_MAX_RETRIES: u32 = 1;
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 1.0;

/// Backoff state machine for one request. The policy only answers go/no-go
/// and the next timeout; the dispatcher owns the retry loop itself.
pub trait RetryPolicy: Send {
    /// Timeout the next attempt should use.
    fn current_timeout(&self) -> Duration;

    /// Attempts consumed so far.
    fn current_retry_count(&self) -> u32;

    /// Prepares the next attempt. Grows the timeout and consumes one
    /// attempt; once the attempt budget is exhausted the triggering error is
    /// handed back and the caller must stop.
    fn retry(&mut self, error: FetchError) -> Result<(), FetchError>;
}

/// Multiplicative backoff with a per-attempt cap on retries.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current_timeout_ms: u64,
    current_retry_count: u32,
    max_retries: u32,
    backoff_multiplier: f32,
}

impl ExponentialBackoff {
    pub fn new(initial_timeout_ms: u64, max_retries: u32, backoff_multiplier: f32) -> Self {
        Self {
            current_timeout_ms: initial_timeout_ms,
            current_retry_count: 0,
            max_retries,
            backoff_multiplier,
        }
    }

    pub fn backoff_multiplier(&self) -> f32 {
        self.backoff_multiplier
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_TIMEOUT_MS,
            DEFAULT_MAX_RETRIES,
            DEFAULT_BACKOFF_MULTIPLIER,
        )
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn current_timeout(&self) -> Duration {
        Duration::from_millis(self.current_timeout_ms)
    }

    fn current_retry_count(&self) -> u32 {
        self.current_retry_count
    }

    fn retry(&mut self, error: FetchError) -> Result<(), FetchError> {
        // The extra millisecond keeps the timeout growing even with a zero
        // multiplier.
        self.current_timeout_ms += 1;
        self.current_timeout_ms +=
            (self.current_timeout_ms as f32 * self.backoff_multiplier) as u64;
        self.current_retry_count += 1;
        if self.current_retry_count > self.max_retries {
            Err(error)
        } else {
            Ok(())
        }
    }
}
