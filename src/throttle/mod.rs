//! Per-API request throttling.
//!
//! Each named API gets a concurrency bound (`max_parallel`) and a minimum
//! spacing between dispatches (`min_interval`). Callers that cannot be
//! admitted wait in a strict FIFO queue and are rejected with
//! [`QueueTimeoutError`] if they wait longer than `queue_timeout`.
//!
//! There is no background task. Waiting callers drive the queue themselves:
//! each one sleeps until the head could next be dispatched, on a release
//! notification, or on its own timeout, and then calls the drain step.
//! APIs without a configured entry share the `"default"` limiter.

mod config;
mod state;

pub use config::{ThrottleConfig, DEFAULT_API};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::ConfigError;
use state::{ApiState, Ticket};

/// A queued request waited longer than its API's `queue_timeout`. The
/// request was never executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Request {request_id} for {api} timed out after {waited:?} in queue")]
pub struct QueueTimeoutError {
    pub request_id: String,
    pub api: String,
    pub waited: Duration,
}

/// Point-in-time view of one limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    pub api: String,
    pub in_flight: usize,
    pub queued: usize,
    pub max_parallel: usize,
}

#[derive(Debug)]
struct Inner {
    configs: HashMap<String, ThrottleConfig>,
    states: Mutex<HashMap<String, ApiState>>,
    /// Signalled whenever a slot is freed so waiters recompute their wake time.
    released: Notify,
}

/// Throttle queue shared by every caller in the process.
///
/// Cheap to clone; clones share limits and state.
#[derive(Debug, Clone)]
pub struct ThrottleQueue {
    inner: Arc<Inner>,
}

impl ThrottleQueue {
    /// Create a queue from per-API limits. A `"default"` entry is added from
    /// the built-in limits if missing.
    pub fn new<I>(configs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, ThrottleConfig)>,
    {
        let mut configs: HashMap<String, ThrottleConfig> = configs.into_iter().collect();
        configs
            .entry(DEFAULT_API.to_string())
            .or_insert_with(ThrottleConfig::default);
        for (api, config) in &configs {
            config.validate(&format!("throttle.{}", api))?;
        }

        Ok(Self {
            inner: Arc::new(Inner {
                configs,
                states: Mutex::new(HashMap::new()),
                released: Notify::new(),
            }),
        })
    }

    /// Queue with the built-in spotify/youtube/default limits.
    pub fn with_defaults() -> Self {
        let configs: HashMap<String, ThrottleConfig> =
            ThrottleConfig::builtin().into_iter().collect();
        Self {
            inner: Arc::new(Inner {
                configs,
                states: Mutex::new(HashMap::new()),
                released: Notify::new(),
            }),
        }
    }

    /// Limiter name used for `api`.
    fn resolve<'a>(&self, api: &'a str) -> &'a str {
        if self.inner.configs.contains_key(api) {
            api
        } else {
            DEFAULT_API
        }
    }

    /// Limits applied to `api`.
    pub fn config_for(&self, api: &str) -> ThrottleConfig {
        self.inner
            .configs
            .get(self.resolve(api))
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ApiState>> {
        // Every mutation leaves the map consistent, so a poisoned lock is safe to reuse.
        self.inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a slot on `api`.
    ///
    /// Resolves once this caller is admitted. The returned permit frees the
    /// slot when released or dropped. Waiters are admitted in call order.
    pub async fn acquire(
        &self,
        api: &str,
        request_id: &str,
    ) -> Result<ThrottlePermit, QueueTimeoutError> {
        let key = self.resolve(api).to_string();
        let config = self.config_for(&key);
        let enqueued_at = Instant::now();

        let (ticket, mut admitted) = {
            let mut states = self.lock();
            let state = states.entry(key.clone()).or_default();
            if let Some(ticket) = state.try_admit(request_id, &config, enqueued_at) {
                debug!("Admitted {} on {} immediately", request_id, key);
                return Ok(ThrottlePermit::new(self.clone(), key, ticket, request_id));
            }
            let (tx, rx) = oneshot::channel();
            let ticket = state.enqueue(request_id, tx);
            debug!(
                "Queued {} on {} ({} in flight, {} waiting)",
                request_id,
                key,
                state.in_flight(),
                state.queued()
            );
            (ticket, rx)
        };

        let mut guard = QueuedGuard {
            queue: self,
            api: &key,
            ticket,
            armed: true,
        };
        let deadline = enqueued_at + config.queue_timeout;

        loop {
            // Register for release notifications before reading the state so
            // a release in between is not missed.
            let released = self.inner.released.notified();
            tokio::pin!(released);
            let wake = {
                let states = self.lock();
                states
                    .get(&key)
                    .and_then(|state| state.next_slot_at(&config, Instant::now()))
            };

            tokio::select! {
                biased;

                result = &mut admitted => {
                    guard.armed = false;
                    if result.is_ok() {
                        debug!(
                            "Admitted {} on {} after {:?}",
                            request_id,
                            key,
                            enqueued_at.elapsed()
                        );
                        return Ok(ThrottlePermit::new(
                            self.clone(),
                            key.clone(),
                            ticket,
                            request_id,
                        ));
                    }
                    // Sender dropped without dispatch: the entry is gone.
                    return Err(self.timeout_error(&key, request_id, enqueued_at));
                }
                _ = sleep_until(deadline) => {
                    let cancelled = self
                        .lock()
                        .get_mut(&key)
                        .is_some_and(|state| state.cancel(ticket));
                    if cancelled {
                        guard.armed = false;
                        let err = self.timeout_error(&key, request_id, enqueued_at);
                        warn!("{}", err);
                        return Err(err);
                    }
                    // Dispatched concurrently; `admitted` is ready.
                }
                _ = sleep_until(wake.unwrap_or(deadline)), if wake.is_some() => {
                    self.drain(&key);
                }
                _ = &mut released => {}
            }
        }
    }

    fn timeout_error(&self, api: &str, request_id: &str, since: Instant) -> QueueTimeoutError {
        QueueTimeoutError {
            request_id: request_id.to_string(),
            api: api.to_string(),
            waited: since.elapsed(),
        }
    }

    /// Dispatch whatever the limiter for `key` currently allows.
    fn drain(&self, key: &str) {
        let config = self.config_for(key);
        let mut states = self.lock();
        if let Some(state) = states.get_mut(key) {
            state.drain(&config, Instant::now());
        }
    }

    fn release_ticket(&self, key: &str, ticket: Ticket) -> bool {
        let config = self.config_for(key);
        let released = {
            let mut states = self.lock();
            match states.get_mut(key) {
                Some(state) => {
                    if state.release(ticket) {
                        state.drain(&config, Instant::now());
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if released {
            self.inner.released.notify_waiters();
        }
        released
    }

    /// Free the slot held under `request_id` on `api`.
    ///
    /// Returns false (and changes nothing) if no such request is in flight,
    /// so releasing twice is harmless.
    pub fn release(&self, api: &str, request_id: &str) -> bool {
        let key = self.resolve(api);
        let config = self.config_for(key);
        let released = {
            let mut states = self.lock();
            match states.get_mut(key) {
                Some(state) => match state.release_request(request_id) {
                    Some(_) => {
                        state.drain(&config, Instant::now());
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if released {
            self.inner.released.notify_waiters();
        } else {
            debug!("Ignoring release of {} on {}: not in flight", request_id, key);
        }
        released
    }

    /// Run `work` while holding a slot on `api`. The slot is freed whether the
    /// work succeeds or fails.
    pub async fn with_throttle<F>(&self, api: &str, work: F) -> Result<F::Output, QueueTimeoutError>
    where
        F: Future,
    {
        let request_id = uuid::Uuid::new_v4().to_string();
        let permit = self.acquire(api, &request_id).await?;
        let output = work.await;
        permit.release();
        Ok(output)
    }

    /// Current load on the limiter used for `api`.
    pub fn stats(&self, api: &str) -> ThrottleStats {
        let key = self.resolve(api);
        let config = self.config_for(key);
        let states = self.lock();
        let (in_flight, queued) = states
            .get(key)
            .map(|s| (s.in_flight(), s.queued()))
            .unwrap_or((0, 0));
        ThrottleStats {
            api: key.to_string(),
            in_flight,
            queued,
            max_parallel: config.max_parallel,
        }
    }
}

impl Default for ThrottleQueue {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Cleans up after an `acquire` future that is dropped while waiting.
struct QueuedGuard<'a> {
    queue: &'a ThrottleQueue,
    api: &'a str,
    ticket: Ticket,
    armed: bool,
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let cancelled = self
            .queue
            .lock()
            .get_mut(self.api)
            .is_some_and(|state| state.cancel(self.ticket));
        if !cancelled {
            // Dispatched but never handed over.
            self.queue.release_ticket(self.api, self.ticket);
        }
    }
}

/// A held slot on one API's limiter.
///
/// Released exactly once: by [`release`](Self::release) or on drop.
#[derive(Debug)]
pub struct ThrottlePermit {
    queue: ThrottleQueue,
    api: String,
    request_id: String,
    ticket: Ticket,
    released: bool,
}

impl ThrottlePermit {
    fn new(queue: ThrottleQueue, api: String, ticket: Ticket, request_id: &str) -> Self {
        Self {
            queue,
            api,
            request_id: request_id.to_string(),
            ticket,
            released: false,
        }
    }

    /// Limiter this permit belongs to (`"default"` for unconfigured APIs).
    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.queue.release_ticket(&self.api, self.ticket);
        }
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}
