//! Retry policy for span batch writes
//!
//! Exponential backoff with optional jitter. A batch is attempted
//! `max_attempts` times in total before it is handed to the error hook.

use rand::Rng;
use std::time::Duration;

use crate::config::TracingConfig;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first
    pub max_attempts: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl From<&TracingConfig> for RetryConfig {
    fn from(config: &TracingConfig) -> Self {
        Self {
            max_attempts: config.flush_max_attempts.max(1),
            initial_delay: config.flush_retry_delay,
            ..Default::default()
        }
    }
}

impl RetryConfig {
    /// A single attempt with no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay before retry number `retry` (0-indexed)
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(retry as i32);

        let clamped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.add_jitter {
            let jitter = clamped_delay * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            clamped_delay + jitter
        } else {
            clamped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

/// Retry state tracker
#[derive(Debug)]
pub struct RetryState {
    config: RetryConfig,
    attempt: usize,
    last_error: Option<String>,
}

impl RetryState {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last_error: None,
        }
    }

    /// Whether another attempt is allowed
    pub fn should_retry(&self) -> bool {
        self.attempt < self.config.max_attempts
    }

    /// Record a failed attempt
    pub fn record_attempt(&mut self, error: impl Into<String>) {
        self.attempt += 1;
        self.last_error = Some(error.into());
    }

    /// Delay before the next attempt
    pub fn next_delay(&self) -> Duration {
        self.config
            .delay_for_retry(self.attempt.saturating_sub(1))
    }

    /// Attempts made so far
    pub fn attempts(&self) -> usize {
        self.attempt
    }

    pub fn remaining_attempts(&self) -> usize {
        self.config.max_attempts.saturating_sub(self.attempt)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Run an async operation until it succeeds or attempts run out.
///
/// On failure returns the last error together with the number of attempts made.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, (E, usize)>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut state = RetryState::new(config.clone());

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                state.record_attempt(e.to_string());

                if !state.should_retry() {
                    return Err((e, state.attempts()));
                }

                let delay = state.next_delay();
                tracing::warn!(
                    attempt = state.attempts(),
                    remaining = state.remaining_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "span batch write failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
