//! Retry policy: exponential backoff with random jitter.

use std::time::Duration;

use inkwell_core::{ApiError, ConfigError};
use rand::Rng;

/// Default number of attempts, the first one included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retries.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Upper bound of the uniform jitter added to each delay.
    pub max_jitter: Duration,
    /// Extra substrings that make an otherwise final error retryable,
    /// matched against the error message and error code.
    pub retry_on: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt, never retried.
    pub fn none() -> Self {
        Self::default().with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn with_retry_on(mut self, pattern: impl Into<String>) -> Self {
        self.retry_on.push(pattern.into());
        self
    }

    /// `initial * multiplier^(attempt - 1)`, capped at `max_delay`.
    ///
    /// `attempt` is the attempt that just failed, starting at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else if capped.is_finite() {
            Duration::ZERO
        } else {
            self.max_delay
        }
    }

    /// Backoff plus uniform jitter in `[0, max_jitter]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.backoff(attempt) + jitter
    }

    /// Retryable categories, or a custom pattern match. Never a cancellation.
    pub fn should_retry(&self, err: &ApiError) -> bool {
        if err.is_cancelled() {
            return false;
        }
        if err.is_retryable() {
            return true;
        }
        self.retry_on.iter().any(|pattern| {
            err.message.contains(pattern.as_str())
                || err.error_code.as_deref().is_some_and(|code| code == pattern.as_str())
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be >= 1"));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                "must be >= initial_delay_ms",
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.multiplier", "must be >= 1.0"));
        }
        Ok(())
    }
}
