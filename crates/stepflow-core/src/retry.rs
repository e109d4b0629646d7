//! Stateless retry policy for step failures.
//!
//! Decision order: cancellation and non-retryable errors never retry, then
//! the attempt budget, then the `no_retry_on` denylist, then the `retry_on`
//! allowlist. Delays follow capped exponential backoff.

use std::time::Duration;

use stepflow_types::workflow::RetryConfig;

use crate::error::StepError;

/// Stateless retry handler. All logic lives in associated functions that
/// take configuration as parameters.
pub struct RetryPolicy;

impl RetryPolicy {
    /// Whether the failed attempt should be retried.
    ///
    /// `attempt` is 1-based: the first execution is attempt 1.
    pub fn should_retry(config: &RetryConfig, error: &StepError, attempt: u32) -> bool {
        if !error.is_retryable() {
            return false;
        }
        if attempt >= config.max_attempts {
            return false;
        }
        let code = error.code();
        if config.no_retry_on.iter().any(|c| c == code) {
            return false;
        }
        if !config.retry_on.is_empty() && !config.retry_on.iter().any(|c| c == code) {
            return false;
        }
        true
    }

    /// Backoff before the next attempt after `attempt` failed:
    /// `min(max_delay, initial * multiplier^(attempt - 1))`.
    pub fn delay_after(config: &RetryConfig, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(exponent as i32);
        let capped = raw.min(config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}
