//! Source health bookkeeping.
//!
//! Callers report the outcome of every real upstream call. A source that
//! accumulates `error_threshold` consecutive errors is degraded and skipped
//! by [`SourceHealthManager::best_source`] until it succeeds again or
//! `recovery_interval` has passed since its last error. Selection never
//! fails: when every candidate is degraded, the one that failed least
//! recently is returned as a recovery probe.

mod source;

pub use source::{Source, UnknownSource, DEFAULT_PREFERENCE};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{millis, ConfigError};

/// Degradation thresholds and default selection order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive errors after which a source is degraded.
    pub error_threshold: u32,
    /// Time after the last error before a degraded source is tried again.
    #[serde(rename = "recovery_interval_ms", with = "millis")]
    pub recovery_interval: Duration,
    /// Order used by `best_source` when called with an empty list.
    pub preference: Vec<Source>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            error_threshold: 6,
            recovery_interval: Duration::from_secs(60),
            preference: DEFAULT_PREFERENCE.to_vec(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.error_threshold == 0 {
            return Err(ConfigError::invalid(
                "health.error_threshold",
                "must be positive",
            ));
        }
        if self.recovery_interval.is_zero() {
            return Err(ConfigError::invalid(
                "health.recovery_interval_ms",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Derived health of a source at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// Past the error threshold; excluded from selection.
    Degraded,
    /// Past the error threshold, but the recovery interval has elapsed so
    /// the source may be probed again.
    Recovering,
}

#[derive(Debug, Clone, Default)]
struct SourceHealth {
    consecutive_errors: u32,
    total_successes: u64,
    total_errors: u64,
    last_error: Option<Instant>,
    last_success: Option<Instant>,
}

impl SourceHealth {
    fn state(&self, config: &HealthConfig, now: Instant) -> HealthState {
        if self.consecutive_errors < config.error_threshold {
            return HealthState::Healthy;
        }
        match self.last_error {
            Some(at) if now.saturating_duration_since(at) < config.recovery_interval => {
                HealthState::Degraded
            }
            _ => HealthState::Recovering,
        }
    }
}

/// Serializable status row for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub source: Source,
    pub state: HealthState,
    pub consecutive_errors: u32,
    pub total_successes: u64,
    pub total_errors: u64,
    /// Milliseconds since the last recorded error.
    pub last_error_ms_ago: Option<u64>,
}

/// Tracks per-source health for the whole process.
#[derive(Debug, Clone)]
pub struct SourceHealthManager {
    config: Arc<HealthConfig>,
    sources: Arc<Mutex<HashMap<Source, SourceHealth>>>,
}

impl Default for SourceHealthManager {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl SourceHealthManager {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config: Arc::new(config),
            sources: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Mark a source healthy and reset its error streak.
    pub async fn register_success(&self, source: Source) {
        let mut sources = self.sources.lock().await;
        let health = sources.entry(source).or_default();
        if health.consecutive_errors >= self.config.error_threshold {
            info!(
                "Source {} recovered after {} consecutive errors",
                source, health.consecutive_errors
            );
        }
        health.consecutive_errors = 0;
        health.total_successes += 1;
        health.last_success = Some(Instant::now());
    }

    /// Extend a source's error streak.
    pub async fn register_error(&self, source: Source) {
        let mut sources = self.sources.lock().await;
        let health = sources.entry(source).or_default();
        health.consecutive_errors = health.consecutive_errors.saturating_add(1);
        health.total_errors += 1;
        health.last_error = Some(Instant::now());

        if health.consecutive_errors == self.config.error_threshold {
            warn!(
                "Source {} degraded after {} consecutive errors",
                source, health.consecutive_errors
            );
        } else {
            debug!(
                "Source {} error streak at {}",
                source, health.consecutive_errors
            );
        }
    }

    /// First non-degraded source in `order`.
    ///
    /// An empty `order` falls back to the configured preference. When every
    /// candidate is degraded, returns the one whose last error is oldest
    /// (earlier entries in `order` win ties).
    pub async fn best_source(&self, order: &[Source]) -> Source {
        let order: &[Source] = if !order.is_empty() {
            order
        } else if !self.config.preference.is_empty() {
            &self.config.preference
        } else {
            &DEFAULT_PREFERENCE
        };

        let sources = self.sources.lock().await;
        let now = Instant::now();
        let state_of = |source: &Source| {
            sources
                .get(source)
                .map(|h| h.state(&self.config, now))
                .unwrap_or(HealthState::Healthy)
        };

        if let Some(source) = order
            .iter()
            .find(|source| state_of(*source) != HealthState::Degraded)
        {
            return *source;
        }

        let probe = order
            .iter()
            .min_by_key(|source| sources.get(*source).and_then(|h| h.last_error))
            .copied()
            .unwrap_or(Source::Spotify);
        debug!("All sources degraded, probing {}", probe);
        probe
    }

    /// Whether `best_source` would consider this source.
    pub async fn is_available(&self, source: Source) -> bool {
        let sources = self.sources.lock().await;
        sources
            .get(&source)
            .map(|h| h.state(&self.config, Instant::now()) != HealthState::Degraded)
            .unwrap_or(true)
    }

    /// Clear every error streak. Totals are kept.
    pub async fn reset_all(&self) {
        let mut sources = self.sources.lock().await;
        for health in sources.values_mut() {
            health.consecutive_errors = 0;
        }
        info!("Reset health for {} sources", sources.len());
    }

    /// Status of every known source, in [`Source::ALL`] order.
    pub async fn snapshot(&self) -> Vec<SourceStatus> {
        let sources = self.sources.lock().await;
        let now = Instant::now();
        Source::ALL
            .iter()
            .map(|&source| {
                let health = sources.get(&source).cloned().unwrap_or_default();
                SourceStatus {
                    source,
                    state: health.state(&self.config, now),
                    consecutive_errors: health.consecutive_errors,
                    total_successes: health.total_successes,
                    total_errors: health.total_errors,
                    last_error_ms_ago: health.last_error.map(|at| {
                        u64::try_from(now.saturating_duration_since(at).as_millis())
                            .unwrap_or(u64::MAX)
                    }),
                }
            })
            .collect()
    }
}
