//! tunegate - adaptive request orchestration for music metadata APIs.
//!
//! Wraps calls to upstream providers (Spotify, Last.fm, YouTube Music,
//! Deezer) with a TTL cache, per-API throttle queues, adaptive retry and
//! backoff, and source health tracking.

pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod retry;
pub mod throttle;

pub use cache::{CacheStats, CacheStore, TtlCache, TtlPolicy};
pub use config::{CacheConfig, ConfigError, OrchestratorConfig};
pub use error::OrchestratorError;
pub use health::{HealthConfig, HealthState, Source, SourceHealthManager, SourceStatus};
pub use orchestrator::{Orchestrator, RequestPhase};
pub use retry::{AdaptiveFn, AdaptiveThrottle, RetryOptions, RetryStats};
pub use throttle::{QueueTimeoutError, ThrottleConfig, ThrottlePermit, ThrottleQueue, ThrottleStats};
