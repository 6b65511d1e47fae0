//! Per-API spacing state for the adaptive wrapper.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::options::RetryOptions;

#[derive(Debug, Clone)]
pub(super) struct RetryState {
    pub current_delay: Duration,
    /// Reserved start time of the most recent call. May lie in the future
    /// while a caller is sleeping towards it.
    pub last_call: Option<Instant>,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_errors: u64,
}

/// Snapshot of one API's adaptive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub current_delay: Duration,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_errors: u64,
}

/// `delay * factor`, saturating instead of panicking on overflow or a
/// non-finite factor.
fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(if factor < 1.0 {
        Duration::ZERO
    } else {
        Duration::MAX
    })
}

impl RetryState {
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            current_delay: initial_delay,
            last_call: None,
            consecutive_errors: 0,
            consecutive_successes: 0,
            total_calls: 0,
            total_errors: 0,
        }
    }

    /// Reserve the next call slot and return how long to wait for it.
    ///
    /// Reserving under the lock keeps concurrent callers spaced out instead
    /// of all waking at the same instant.
    pub fn reserve(&mut self, now: Instant) -> Duration {
        let wait = match self.last_call {
            Some(last) => (last + self.current_delay).saturating_duration_since(now),
            None => Duration::ZERO,
        };
        self.last_call = Some(now + wait);
        wait
    }

    /// Record a successful attempt. Returns the new spacing if it shrank.
    pub fn record_success(&mut self, options: &RetryOptions) -> Option<Duration> {
        self.total_calls += 1;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_errors = 0;

        if !options.adaptive || self.consecutive_successes <= options.recovery_threshold {
            return None;
        }
        let previous = self.current_delay;
        self.current_delay = options.clamp(scale(previous, 1.0 / options.success_divisor));
        (self.current_delay < previous).then_some(self.current_delay)
    }

    /// Record a failed attempt. Returns the new spacing if it grew.
    pub fn record_failure(&mut self, options: &RetryOptions) -> Option<Duration> {
        self.total_calls += 1;
        self.total_errors += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.consecutive_successes = 0;

        if !options.adaptive {
            return None;
        }
        let previous = self.current_delay;
        self.current_delay = options.clamp(scale(previous, options.error_multiplier));
        (self.current_delay > previous).then_some(self.current_delay)
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            current_delay: self.current_delay,
            consecutive_errors: self.consecutive_errors,
            consecutive_successes: self.consecutive_successes,
            total_calls: self.total_calls,
            total_errors: self.total_errors,
        }
    }
}
