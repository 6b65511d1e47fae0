//! Adaptive retry and backoff.
//!
//! Every API name carries a spacing delay between consecutive calls that
//! grows multiplicatively on failures and shrinks again after a run of
//! successes, always clamped to `[initial_delay, max_delay]`. Failed calls
//! are retried with a linear backoff (`retry_delay * attempt`) that is
//! independent of the adaptive spacing. This layer is separate from
//! [`ThrottleQueue`](crate::throttle::ThrottleQueue); both apply when
//! composed.

mod options;
mod state;

pub use options::RetryOptions;
pub use state::RetryStats;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use state::RetryState;

/// Shared adaptive state for every wrapped call, keyed by API name.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveThrottle {
    states: Arc<Mutex<HashMap<String, RetryState>>>,
}

impl AdaptiveThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with adaptive spacing and retries.
    ///
    /// `f` is called at most `max_retries + 1` times. The first success is
    /// returned immediately; once attempts are exhausted the last error is
    /// returned unchanged.
    pub async fn call<F, Fut, T, E>(&self, api: &str, options: &RetryOptions, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_retrying_if(api, options, |_| true, f).await
    }

    /// Like [`call`](Self::call), but an error for which `retryable` returns
    /// false is returned at once. Such errors leave the adaptive state alone.
    ///
    /// The spacing wait applies once per invocation. Retries only wait out
    /// the linear backoff.
    pub async fn call_retrying_if<F, Fut, T, E, R>(
        &self,
        api: &str,
        options: &RetryOptions,
        retryable: R,
        mut f: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let wait = {
            let mut states = self.states.lock().await;
            states
                .entry(api.to_string())
                .or_insert_with(|| RetryState::new(options.initial_delay))
                .reserve(Instant::now())
        };
        if !wait.is_zero() {
            debug!("{}: spacing call by {:?}", api, wait);
            sleep(wait).await;
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            match f().await {
                Ok(value) => {
                    let mut states = self.states.lock().await;
                    if let Some(state) = states.get_mut(api) {
                        if let Some(delay) = state.record_success(options) {
                            info!("{}: recovering, delay reduced to {:?}", api, delay);
                        }
                    }
                    return Ok(value);
                }
                Err(err) if !retryable(&err) => {
                    debug!("{}: attempt {} failed, not retrying", api, attempt);
                    return Err(err);
                }
                Err(err) => {
                    {
                        let mut states = self.states.lock().await;
                        if let Some(state) = states.get_mut(api) {
                            if let Some(delay) = state.record_failure(options) {
                                warn!("{}: call failed, delay increased to {:?}", api, delay);
                            }
                        }
                    }

                    if attempt > options.max_retries {
                        warn!("{}: giving up after {} attempts", api, attempt);
                        return Err(err);
                    }

                    let backoff = options.retry_delay.saturating_mul(attempt);
                    debug!(
                        "{}: attempt {} failed, retrying in {:?}",
                        api, attempt, backoff
                    );
                    sleep(backoff).await;
                }
            }
        }
    }

    /// Bind `f` to an API name and options, validating the options once.
    pub fn wrap<F>(
        &self,
        f: F,
        options: RetryOptions,
        api: impl Into<String>,
    ) -> Result<AdaptiveFn<F>, ConfigError> {
        let api = api.into();
        options.validate(&format!("retry.{}", api))?;
        Ok(AdaptiveFn {
            throttle: self.clone(),
            api,
            options,
            f,
        })
    }

    /// Snapshot of an API's adaptive state, if it has been called.
    pub async fn stats(&self, api: &str) -> Option<RetryStats> {
        self.states.lock().await.get(api).map(RetryState::stats)
    }
}

/// A function bound to [`AdaptiveThrottle`] state for one API.
pub struct AdaptiveFn<F> {
    throttle: AdaptiveThrottle,
    api: String,
    options: RetryOptions,
    f: F,
}

impl<F> AdaptiveFn<F> {
    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }
}

impl<F, Fut, T, E> AdaptiveFn<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    pub async fn call(&mut self) -> Result<T, E> {
        self.throttle
            .call(&self.api, &self.options, &mut self.f)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_options() -> RetryOptions {
        RetryOptions::new(Duration::from_millis(100), Duration::from_secs(2))
            .with_retry_delay(Duration::from_millis(1000))
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_calls_max_retries_plus_one() {
        let throttle = AdaptiveThrottle::new();
        let calls = AtomicU32::new(0);
        let options = fast_options().with_max_retries(3);

        let result: Result<(), String> = throttle
            .call("spotify", &options, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(format!("boom {}", n)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result, Err("boom 4".to_string()));

        let stats = throttle.stats("spotify").await.unwrap();
        assert_eq!(stats.consecutive_errors, 4);
        assert_eq!(stats.total_errors, 4);
        assert!(stats.current_delay > options.initial_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn success_returns_without_spending_retries() {
        let throttle = AdaptiveThrottle::new();
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = throttle
            .call("youtube", &fast_options(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 2 {
                        Err("flaky".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stats = throttle.stats("youtube").await.unwrap();
        assert_eq!(stats.consecutive_errors, 0);
        assert_eq!(stats.consecutive_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_linearly() {
        let throttle = AdaptiveThrottle::new();
        let start = Instant::now();
        let times = std::sync::Mutex::new(Vec::new());

        let _: Result<(), ()> = throttle
            .call("lastfm", &fast_options().with_adaptive(false), || {
                times.lock().unwrap().push(start.elapsed());
                async { Err(()) }
            })
            .await;

        let times = times.into_inner().unwrap();
        assert_eq!(
            times,
            vec![
                Duration::ZERO,
                Duration::from_millis(1000),
                Duration::from_millis(3000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_skip_adaptive_spacing() {
        let throttle = AdaptiveThrottle::new();
        let options = RetryOptions::new(Duration::from_secs(2), Duration::from_secs(10))
            .with_retry_delay(Duration::from_millis(100))
            .with_max_retries(1);
        // Prime the spacing so the next invocation starts 2s out.
        let _: Result<(), ()> = throttle.call("spotify", &options, || async { Ok(()) }).await;

        let start = Instant::now();
        let times = std::sync::Mutex::new(Vec::new());
        let _: Result<(), ()> = throttle
            .call("spotify", &options, || {
                times.lock().unwrap().push(start.elapsed());
                async { Err(()) }
            })
            .await;

        let times = times.into_inner().unwrap();
        assert_eq!(
            times,
            vec![Duration::from_secs(2), Duration::from_millis(2100)]
        );
        // The failure still grew the spacing for the next invocation.
        let stats = throttle.stats("spotify").await.unwrap();
        assert!(stats.current_delay > Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_returns_at_once() {
        let throttle = AdaptiveThrottle::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), &str> = throttle
            .call_retrying_if(
                "youtube",
                &fast_options(),
                |err: &&str| *err != "queue full",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("queue full") }
                },
            )
            .await;

        assert_eq!(result, Err("queue full"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = throttle.stats("youtube").await.unwrap();
        assert_eq!(stats.total_errors, 0);
        assert_eq!(stats.current_delay, fast_options().initial_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_calls_are_spaced() {
        let throttle = AdaptiveThrottle::new();
        let options = RetryOptions::new(Duration::from_millis(250), Duration::from_secs(5));
        let start = Instant::now();

        for _ in 0..3 {
            let _: Result<(), ()> = throttle.call("deezer", &options, || async { Ok(()) }).await;
        }

        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn apis_track_independent_state() {
        let throttle = AdaptiveThrottle::new();
        let options = fast_options().with_max_retries(0);

        let _: Result<(), ()> = throttle.call("spotify", &options, || async { Err(()) }).await;
        let _: Result<(), ()> = throttle.call("youtube", &options, || async { Ok(()) }).await;

        assert_eq!(throttle.stats("spotify").await.unwrap().consecutive_errors, 1);
        assert_eq!(throttle.stats("youtube").await.unwrap().consecutive_errors, 0);
        assert!(throttle.stats("deezer").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wrapped_fn_reuses_state() {
        let throttle = AdaptiveThrottle::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut wrapped = throttle
            .wrap(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, ()>("ok") }
                },
                fast_options(),
                "spotify",
            )
            .unwrap();

        assert_eq!(wrapped.call().await, Ok("ok"));
        assert_eq!(wrapped.call().await, Ok("ok"));
        assert_eq!(wrapped.api(), "spotify");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(throttle.stats("spotify").await.unwrap().total_calls, 2);
    }

    #[test]
    fn wrap_rejects_invalid_options() {
        let throttle = AdaptiveThrottle::new();
        let options = RetryOptions {
            initial_delay: Duration::ZERO,
            ..Default::default()
        };
        let result = throttle.wrap(|| async { Ok::<(), ()>(()) }, options, "spotify");
        assert!(result.is_err());
    }
}
