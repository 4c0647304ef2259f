//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use super::policy::RetryConfig;

/// No retry ever waits less than this.
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Jitter spread: each delay moves by up to this fraction either way.
pub const JITTER_SPREAD: f64 = 0.25;

/// Delay before the retry following backoff step `step` (0-based).
///
/// `base_delay * backoff_factor^step`, capped at `max_delay`, spread by up to
/// ±25 % when jitter is enabled, never below [`MIN_DELAY`].
#[must_use]
pub fn backoff_delay(config: &RetryConfig, step: u32) -> Duration {
    let offset = if config.jitter {
        rand::rng().random_range(-JITTER_SPREAD..=JITTER_SPREAD)
    } else {
        0.0
    };
    delay_with_offset(config, step, offset)
}

/// Deterministic core of [`backoff_delay`]; `offset` is the jitter fraction.
#[must_use]
pub fn delay_with_offset(config: &RetryConfig, step: u32, offset: f64) -> Duration {
    let exponent = i32::try_from(step).unwrap_or(i32::MAX);
    let max_secs = config.max_delay.as_secs_f64();
    let raw = config.base_delay.as_secs_f64() * config.backoff_factor.powi(exponent);
    let capped = if raw.is_finite() { raw.min(max_secs) } else { max_secs };
    let jittered = capped * (1.0 + offset.clamp(-JITTER_SPREAD, JITTER_SPREAD));
    Duration::from_secs_f64(jittered).max(MIN_DELAY)
}

/// Wait to honour a rate-limit hint, capped by the policy.
#[must_use]
pub fn rate_limit_delay(config: &RetryConfig, retry_after: Duration) -> Duration {
    retry_after.min(config.rate_limit_cap).max(MIN_DELAY)
}
