//! Adaptive retry options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{millis, ConfigError};

/// Options for [`AdaptiveThrottle`](super::AdaptiveThrottle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Starting spacing between calls, and the floor it recovers to.
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    /// Ceiling for the spacing.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Grow and shrink the spacing based on outcomes.
    pub adaptive: bool,
    /// Spacing multiplier applied on each failed attempt (>= 1).
    pub error_multiplier: f64,
    /// Spacing divisor applied on success once past the recovery threshold (>= 1).
    pub success_divisor: f64,
    /// Consecutive successes required before the spacing starts shrinking.
    pub recovery_threshold: u32,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base for the linear backoff between retries (`retry_delay * attempt`).
    #[serde(rename = "retry_delay_ms", with = "millis")]
    pub retry_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryOptions {
    /// Options with the given spacing bounds and default tuning.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            adaptive: true,
            error_multiplier: 1.5,
            success_divisor: 1.2,
            recovery_threshold: 5,
            max_retries: 2,
            retry_delay: Duration::from_millis(1000),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }

    /// Clamp a spacing into `[initial_delay, max_delay]`.
    pub(super) fn clamp(&self, delay: Duration) -> Duration {
        delay.min(self.max_delay).max(self.initial_delay)
    }

    /// `field` prefixes error messages. A zero `retry_delay` is allowed and
    /// means retries follow each other immediately.
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.initial_delay.is_zero() {
            return Err(ConfigError::invalid(
                format!("{}.initial_delay_ms", field),
                "must be positive",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::invalid(
                format!("{}.max_delay_ms", field),
                "must not be below initial_delay_ms",
            ));
        }
        if !self.error_multiplier.is_finite() || self.error_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                format!("{}.error_multiplier", field),
                "must be a finite number >= 1",
            ));
        }
        if !self.success_divisor.is_finite() || self.success_divisor < 1.0 {
            return Err(ConfigError::invalid(
                format!("{}.success_divisor", field),
                "must be a finite number >= 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = RetryOptions::default();
        assert!(options.adaptive);
        assert_eq!(options.error_multiplier, 1.5);
        assert_eq!(options.success_divisor, 1.2);
        assert_eq!(options.max_retries, 2);
        assert_eq!(options.retry_delay, Duration::from_secs(1));
        options.validate("retry").unwrap();
    }

    #[test]
    fn rejects_shrinking_multiplier() {
        let options = RetryOptions {
            error_multiplier: 0.5,
            ..Default::default()
        };
        assert!(options.validate("retry").is_err());

        let options = RetryOptions {
            success_divisor: f64::NAN,
            ..Default::default()
        };
        assert!(options.validate("retry").is_err());
    }

    #[test]
    fn clamp_stays_in_bounds() {
        let options = RetryOptions::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(options.clamp(Duration::ZERO), Duration::from_millis(100));
        assert_eq!(options.clamp(Duration::from_secs(5)), Duration::from_secs(1));
        assert_eq!(
            options.clamp(Duration::from_millis(300)),
            Duration::from_millis(300)
        );
    }
}
