//! Retry policy shared by reconnection and resubscription.
//!
//! Timers advance by the `delta` handed to `Session::tick`, never by wall
//! clock, so retry behaviour is reproducible.

use std::time::Duration;

use vts_core::BackoffConfig;

/// Exponential backoff with a cap and an optional attempt limit.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
    multiplier: f64,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Create a policy retrying forever.
    #[must_use]
    pub const fn exponential(base: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            base,
            max,
            multiplier,
            max_attempts: None,
        }
    }

    /// Limit the number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Build a policy from configuration.
    #[must_use]
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before attempt number `attempts + 1`, or `None` once the limit
    /// is reached.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempts >= max) {
            return None;
        }
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let nanos = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.max.as_nanos() as f64).max(0.0);
        Some(Duration::from_nanos(capped.round() as u64))
    }

    #[must_use]
    pub const fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// Countdown to the next attempt plus the number of attempts made.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
    remaining: Option<Duration>,
}

impl RetryState {
    /// Arm the timer.
    pub const fn schedule(&mut self, delay: Duration) {
        self.remaining = Some(delay);
    }

    /// Advance the timer. Returns true, and counts an attempt, when it fires.
    pub fn advance(&mut self, delta: Duration) -> bool {
        match self.remaining {
            Some(remaining) if remaining <= delta => {
                self.remaining = None;
                self.attempts = self.attempts.saturating_add(1);
                true
            }
            Some(remaining) => {
                self.remaining = Some(remaining - delta);
                false
            }
            None => false,
        }
    }

    /// Disarm the timer and forget past attempts.
    pub const fn reset(&mut self) {
        self.attempts = 0;
        self.remaining = None;
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn is_scheduled(&self) -> bool {
        self.remaining.is_some()
    }
}
