//! Request facade composing the cache, throttle, retry and health layers.
//!
//! A request moves through these phases:
//!
//! ```text
//! pending -> cache_hit
//! pending -> queued -> in_flight -> success
//!                      in_flight -> retry -> in_flight
//!                      in_flight -> exhausted
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheStore, TtlCache, TtlPolicy};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::error::OrchestratorError;
use crate::health::{Source, SourceHealthManager};
use crate::retry::AdaptiveThrottle;
use crate::throttle::ThrottleQueue;

/// Lifecycle phase of one logical request, used in debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Pending,
    CacheHit,
    Queued,
    InFlight,
    Retry,
    Success,
    Exhausted,
}

impl RequestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPhase::Pending => "pending",
            RequestPhase::CacheHit => "cache_hit",
            RequestPhase::Queued => "queued",
            RequestPhase::InFlight => "in_flight",
            RequestPhase::Retry => "retry",
            RequestPhase::Success => "success",
            RequestPhase::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestPhase::CacheHit | RequestPhase::Success | RequestPhase::Exhausted
        )
    }
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide request orchestrator.
///
/// Construct once at startup and share by clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    cache: Arc<dyn CacheStore>,
    /// Set when the orchestrator owns its in-process cache.
    local_cache: Option<TtlCache>,
    ttl_policy: Arc<TtlPolicy>,
    throttle: ThrottleQueue,
    adaptive: AdaptiveThrottle,
    health: SourceHealthManager,
    config: Arc<OrchestratorConfig>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("local_cache", &self.local_cache.is_some())
            .field("throttle", &self.throttle)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Validate `config` and build every layer with an in-process cache.
    pub fn new(config: OrchestratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let local = TtlCache::new();
        let throttle = ThrottleQueue::new(config.throttle.clone())?;

        Ok(Self {
            cache: Arc::new(local.clone()),
            local_cache: Some(local),
            ttl_policy: Arc::new(config.cache.ttl_policy()),
            throttle,
            adaptive: AdaptiveThrottle::new(),
            health: SourceHealthManager::new(config.health.clone()),
            config: Arc::new(config),
        })
    }

    /// Replace the cache with another store.
    pub fn with_cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = store;
        self.local_cache = None;
        self
    }

    /// Start the periodic sweep of the in-process cache.
    ///
    /// Returns `None` when a custom store replaced it or `sweep_interval` is
    /// zero.
    pub fn spawn_cache_sweeper(&self) -> Option<JoinHandle<()>> {
        let interval = self.config.cache.sweep_interval;
        if interval.is_zero() {
            debug!("Cache sweeper disabled");
            return None;
        }
        self.local_cache
            .as_ref()
            .map(|cache| cache.spawn_sweeper(interval))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn local_cache(&self) -> Option<&TtlCache> {
        self.local_cache.as_ref()
    }

    pub fn throttle(&self) -> &ThrottleQueue {
        &self.throttle
    }

    pub fn adaptive(&self) -> &AdaptiveThrottle {
        &self.adaptive
    }

    pub fn health(&self) -> &SourceHealthManager {
        &self.health
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl_policy
    }

    fn cache_key(source: Source, endpoint: &str) -> String {
        format!("{}:{}", source, endpoint)
    }

    /// Return the cached value for `(source, endpoint)` or fetch it.
    ///
    /// A miss runs `fetcher` through the source's throttle queue and the
    /// adaptive retry wrapper, reports the final outcome to the health
    /// manager, and caches a success with the endpoint's TTL.
    ///
    /// Every attempt takes its own throttle permit, so a request sleeping
    /// between retries does not hold a slot. A queue timeout on any attempt
    /// ends the request at once and is not counted against the source.
    pub async fn fetch<T, E, F, Fut>(
        &self,
        source: Source,
        endpoint: &str,
        mut fetcher: F,
    ) -> Result<T, OrchestratorError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let request_id = Uuid::new_v4().to_string();
        let key = Self::cache_key(source, endpoint);
        debug!("{} {}: {}", request_id, key, RequestPhase::Pending);

        if let Some(raw) = self.cache.get(&key).await {
            match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    debug!("{} {}: {}", request_id, key, RequestPhase::CacheHit);
                    return Ok(value);
                }
                Err(e) => {
                    warn!("Discarding unreadable cache entry {}: {}", key, e);
                    self.cache.del(&key).await;
                }
            }
        }

        let api = source.as_str();
        let options = self.config.retry_for(api);
        let throttle = &self.throttle;
        let request_id = request_id.as_str();
        let key = key.as_str();
        // Each attempt calls it from its own future.
        let fetcher = Mutex::new(&mut fetcher);
        let fetcher = &fetcher;
        let mut attempt = 0u32;

        let result = self
            .adaptive
            .call_retrying_if(
                api,
                &options,
                |err: &OrchestratorError<E>| !err.is_queue_timeout(),
                || {
                    attempt += 1;
                    let attempt = attempt;
                    let phase = if attempt == 1 {
                        RequestPhase::InFlight
                    } else {
                        RequestPhase::Retry
                    };
                    async move {
                        debug!("{} {}: {}", request_id, key, RequestPhase::Queued);
                        let permit = match throttle.acquire(api, request_id).await {
                            Ok(permit) => permit,
                            Err(e) => return Err(OrchestratorError::QueueTimeout(e)),
                        };
                        debug!("{} {}: {} (attempt {})", request_id, key, phase, attempt);
                        let call = {
                            let mut fetcher =
                                fetcher.lock().unwrap_or_else(PoisonError::into_inner);
                            (*fetcher)()
                        };
                        let output = call.await;
                        permit.release();
                        output.map_err(OrchestratorError::Upstream)
                    }
                },
            )
            .await;

        match result {
            Ok(value) => {
                self.health.register_success(source).await;
                match serde_json::to_string(&value) {
                    Ok(raw) => {
                        let ttl = self.ttl_policy.ttl_for(endpoint);
                        self.cache.set(key, raw, Some(ttl)).await;
                    }
                    Err(e) => warn!("Not caching {}: {}", key, e),
                }
                debug!("{} {}: {}", request_id, key, RequestPhase::Success);
                Ok(value)
            }
            Err(err @ OrchestratorError::QueueTimeout(_)) => Err(err),
            Err(err) => {
                self.health.register_error(source).await;
                debug!("{} {}: {}", request_id, key, RequestPhase::Exhausted);
                Err(err)
            }
        }
    }

    /// Fetch from the healthiest source in `order`.
    ///
    /// The chosen source is passed to `fetcher` and returned with the value.
    /// An empty `order` uses the configured preference.
    pub async fn fetch_from_best<T, E, F, Fut>(
        &self,
        order: &[Source],
        endpoint: &str,
        mut fetcher: F,
    ) -> Result<(Source, T), OrchestratorError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Source) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let source = self.health.best_source(order).await;
        let value = self.fetch(source, endpoint, || fetcher(source)).await?;
        Ok((source, value))
    }

    /// Drop the cached value for `(source, endpoint)`.
    pub async fn invalidate(&self, source: Source, endpoint: &str) {
        self.cache.del(&Self::cache_key(source, endpoint)).await;
    }
}
