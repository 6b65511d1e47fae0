//! Per-API throttle limits.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{millis, ConfigError};

/// Name of the limiter used for APIs without their own entry.
pub const DEFAULT_API: &str = "default";

/// Concurrency and spacing limits for one upstream API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Minimum time between two dispatched requests.
    #[serde(rename = "min_interval_ms", with = "millis")]
    pub min_interval: Duration,
    /// Maximum requests in flight at once.
    pub max_parallel: usize,
    /// How long a request may wait in the queue before it is rejected.
    #[serde(rename = "queue_timeout_ms", with = "millis")]
    pub queue_timeout: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(50),
            10,
            Duration::from_secs(15),
        )
    }
}

impl ThrottleConfig {
    pub fn new(min_interval: Duration, max_parallel: usize, queue_timeout: Duration) -> Self {
        Self {
            min_interval,
            max_parallel,
            queue_timeout,
        }
    }

    /// Built-in limits: Spotify allows roughly 10 requests per second,
    /// YouTube is stricter, everything else shares a generous default.
    pub fn builtin() -> BTreeMap<String, ThrottleConfig> {
        BTreeMap::from([
            (
                "spotify".to_string(),
                Self::new(Duration::from_millis(100), 5, Duration::from_secs(30)),
            ),
            (
                "youtube".to_string(),
                Self::new(Duration::from_millis(200), 3, Duration::from_secs(30)),
            ),
            (DEFAULT_API.to_string(), Self::default()),
        ])
    }

    /// All limits must be positive. `field` prefixes error messages.
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.min_interval.is_zero() {
            return Err(ConfigError::invalid(
                format!("{}.min_interval_ms", field),
                "must be positive",
            ));
        }
        if self.max_parallel == 0 {
            return Err(ConfigError::invalid(
                format!("{}.max_parallel", field),
                "must be positive",
            ));
        }
        if self.queue_timeout.is_zero() {
            return Err(ConfigError::invalid(
                format!("{}.queue_timeout_ms", field),
                "must be positive",
            ));
        }
        Ok(())
    }
}
