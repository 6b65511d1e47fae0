//! Orchestrator configuration.
//!
//! Loaded from a TOML file, with built-in defaults for anything the file
//! leaves out and a handful of environment overrides applied on top. Every
//! section is validated once, at load time, so the runtime components can
//! trust their inputs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{TtlPolicy, DEFAULT_CACHE_TTL};
use crate::health::HealthConfig;
use crate::retry::RetryOptions;
use crate::throttle::{ThrottleConfig, DEFAULT_API};

/// Default interval between expired-entry sweeps (5 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Cache section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for endpoint kinds without an explicit entry.
    #[serde(rename = "default_ttl_ms", with = "millis")]
    pub default_ttl: Duration,
    /// Interval of the background sweep. Zero disables the sweeper.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
    /// Per-kind TTLs in milliseconds, keyed by the endpoint's first segment.
    pub ttl_by_kind: BTreeMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let policy = TtlPolicy::default();
        Self {
            default_ttl: DEFAULT_CACHE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            ttl_by_kind: policy
                .kinds()
                .map(|(kind, ttl)| {
                    (
                        kind.to_string(),
                        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
                    )
                })
                .collect(),
        }
    }
}

impl CacheConfig {
    /// Build the TTL policy described by this section.
    pub fn ttl_policy(&self) -> TtlPolicy {
        let mut policy = TtlPolicy::new(self.default_ttl);
        for (kind, ms) in &self.ttl_by_kind {
            policy = policy.with_kind(kind, Duration::from_millis(*ms));
        }
        policy
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl.is_zero() {
            return Err(ConfigError::invalid(
                "cache.default_ttl_ms",
                "must be positive",
            ));
        }
        if let Some((kind, _)) = self.ttl_by_kind.iter().find(|(_, ms)| **ms == 0) {
            return Err(ConfigError::invalid(
                format!("cache.ttl_by_kind.{}", kind),
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Complete orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Throttle limits per upstream API name.
    pub throttle: BTreeMap<String, ThrottleConfig>,
    /// Adaptive retry options per upstream API name.
    pub retry: BTreeMap<String, RetryOptions>,
    pub health: HealthConfig,
    pub cache: CacheConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            throttle: ThrottleConfig::builtin(),
            retry: BTreeMap::from([(DEFAULT_API.to_string(), RetryOptions::default())]),
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?.with_env_overrides();
        config.validate()?;
        tracing::debug!("Loaded orchestrator config from {}", path.display());
        Ok(config)
    }

    /// Parse TOML and fill in built-in entries the document leaves out.
    ///
    /// Does not apply environment overrides or validate.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(contents)?;
        config.fill_builtin_apis();
        Ok(config)
    }

    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Re-insert built-in API entries missing from a parsed document, so that
    /// overriding `[throttle.spotify]` does not drop the `default` limiter.
    fn fill_builtin_apis(&mut self) {
        for (api, config) in ThrottleConfig::builtin() {
            self.throttle.entry(api).or_insert(config);
        }
        self.retry
            .entry(DEFAULT_API.to_string())
            .or_insert_with(RetryOptions::default);
    }

    /// Apply overrides from the process environment.
    ///
    /// - `TUNEGATE_CACHE_TTL_MS` - default cache TTL
    /// - `TUNEGATE_HEALTH_THRESHOLD` - consecutive errors before degrading a source
    /// - `TUNEGATE_HEALTH_RECOVERY_MS` - time before a degraded source is probed again
    /// - `TUNEGATE_MAX_RETRIES` - retry budget for every API
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |name: &str| {
            let raw = lookup(name)?;
            match raw.trim().parse::<u64>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Ignoring {}={:?}: not an integer", name, raw);
                    None
                }
            }
        };

        if let Some(ms) = number("TUNEGATE_CACHE_TTL_MS") {
            self.cache.default_ttl = Duration::from_millis(ms);
        }
        if let Some(threshold) = number("TUNEGATE_HEALTH_THRESHOLD") {
            self.health.error_threshold = u32::try_from(threshold).unwrap_or(u32::MAX);
        }
        if let Some(ms) = number("TUNEGATE_HEALTH_RECOVERY_MS") {
            self.health.recovery_interval = Duration::from_millis(ms);
        }
        if let Some(retries) = number("TUNEGATE_MAX_RETRIES") {
            let retries = u32::try_from(retries).unwrap_or(u32::MAX);
            for options in self.retry.values_mut() {
                options.max_retries = retries;
            }
        }
        self
    }

    /// Retry options for an API, falling back to the `default` entry.
    pub fn retry_for(&self, api: &str) -> RetryOptions {
        self.retry
            .get(api)
            .or_else(|| self.retry.get(DEFAULT_API))
            .cloned()
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.throttle.contains_key(DEFAULT_API) {
            return Err(ConfigError::invalid(
                "throttle",
                format!("missing the \"{}\" entry", DEFAULT_API),
            ));
        }
        for (api, config) in &self.throttle {
            config.validate(&format!("throttle.{}", api))?;
        }
        for (api, options) in &self.retry {
            options.validate(&format!("retry.{}", api))?;
        }
        self.health.validate()?;
        self.cache.validate()
    }
}
