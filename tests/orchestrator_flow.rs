//! End-to-end behaviour of the orchestrator facade.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tunegate::{
    HealthState, Orchestrator, OrchestratorConfig, OrchestratorError, RetryOptions, Source,
    ThrottleConfig,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Defaults with fast retries so virtual time stays short.
fn config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.retry.insert(
        "default".to_string(),
        RetryOptions::new(ms(1), ms(100)).with_retry_delay(ms(10)),
    );
    config
}

#[tokio::test(start_paused = true)]
async fn cached_value_skips_upstream() {
    let orchestrator = Orchestrator::new(config()).unwrap();
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let tracks: Vec<String> = orchestrator
            .fetch(Source::Spotify, "recommendations:chill", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(vec!["Teardrop".to_string()]) }
            })
            .await
            .unwrap();
        assert_eq!(tracks, vec!["Teardrop".to_string()]);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = orchestrator.local_cache().unwrap().stats().await;
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.entries, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_return_upstream_error_and_record_health() {
    let orchestrator = Orchestrator::new(config()).unwrap();
    let calls = AtomicU32::new(0);

    let result: Result<u32, _> = orchestrator
        .fetch(Source::Deezer, "tracks:9", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("503 Service Unavailable") }
        })
        .await;

    // Default budget: one attempt plus two retries.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let err = result.unwrap_err();
    assert!(!err.is_queue_timeout());
    assert_eq!(err.into_upstream(), Some("503 Service Unavailable"));

    let deezer = orchestrator
        .health()
        .snapshot()
        .await
        .into_iter()
        .find(|status| status.source == Source::Deezer)
        .unwrap();
    assert_eq!(deezer.consecutive_errors, 1);
    assert_eq!(deezer.total_errors, 1);

    // Failures are not cached.
    assert!(orchestrator.cache().get("deezer:tracks:9").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn degraded_source_falls_back_to_next_preference() {
    let mut config = config();
    config.health.error_threshold = 2;
    for options in config.retry.values_mut() {
        options.max_retries = 0;
    }
    let orchestrator = Orchestrator::new(config).unwrap();

    for _ in 0..2 {
        let result: Result<String, OrchestratorError<String>> = orchestrator
            .fetch(Source::Spotify, "search:bjork", || async {
                Err("429 Too Many Requests".to_string())
            })
            .await;
        assert!(result.is_err());
    }
    assert!(!orchestrator.health().is_available(Source::Spotify).await);

    let chosen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = chosen.clone();
    let (source, value) = orchestrator
        .fetch_from_best(&[], "search:bjork", move |source| {
            seen.lock().unwrap().push(source);
            async move { Ok::<_, String>(format!("results from {}", source)) }
        })
        .await
        .unwrap();

    assert_eq!(source, Source::Lastfm);
    assert_eq!(value, "results from lastfm");
    assert_eq!(*chosen.lock().unwrap(), vec![Source::Lastfm]);
}

#[tokio::test(start_paused = true)]
async fn queue_timeout_surfaces_without_calling_upstream() {
    let mut config = config();
    config
        .throttle
        .insert("spotify".to_string(), ThrottleConfig::new(ms(10), 1, ms(100)));
    let orchestrator = Orchestrator::new(config).unwrap();

    let _held = orchestrator
        .throttle()
        .acquire("spotify", "long-running")
        .await
        .unwrap();

    let calls = AtomicU32::new(0);
    let result: Result<u32, OrchestratorError<String>> = orchestrator
        .fetch(Source::Spotify, "artists:42", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(1) }
        })
        .await;

    match result {
        Err(OrchestratorError::QueueTimeout(timeout)) => {
            assert_eq!(timeout.api, "spotify");
            assert!(timeout.waited >= ms(100));
        }
        other => panic!("expected a queue timeout, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let spotify = &orchestrator.health().snapshot().await[0];
    assert_eq!(spotify.source, Source::Spotify);
    assert_eq!(spotify.state, HealthState::Healthy);
    assert_eq!(spotify.total_errors, 0);
}

async fn fetch_both(
    orchestrator: &Orchestrator,
    search_calls: &AtomicU32,
    album_calls: &AtomicU32,
) {
    let _: u8 = orchestrator
        .fetch(Source::Youtube, "search:abba", || {
            search_calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(1) }
        })
        .await
        .unwrap();
    let _: u8 = orchestrator
        .fetch(Source::Youtube, "albums:arrival", || {
            album_calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(2) }
        })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn ttl_follows_endpoint_kind() {
    let orchestrator = Orchestrator::new(config()).unwrap();
    let search_calls = AtomicU32::new(0);
    let album_calls = AtomicU32::new(0);

    fetch_both(&orchestrator, &search_calls, &album_calls).await;
    tokio::time::advance(Duration::from_secs(29 * 60)).await;
    fetch_both(&orchestrator, &search_calls, &album_calls).await;
    assert_eq!(search_calls.load(Ordering::SeqCst), 1);

    // Search results live for 30 minutes, albums for a day.
    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    fetch_both(&orchestrator, &search_calls, &album_calls).await;
    assert_eq!(search_calls.load(Ordering::SeqCst), 2);
    assert_eq!(album_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_respect_parallel_limit() {
    let mut config = config();
    config
        .throttle
        .insert("youtube".to_string(), ThrottleConfig::new(ms(1), 3, ms(10_000)));
    let orchestrator = Orchestrator::new(config).unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let requests = (0..8).map(|i| {
        let orchestrator = orchestrator.clone();
        let active = active.clone();
        let peak = peak.clone();
        async move {
            let endpoint = format!("tracks:{}", i);
            orchestrator
                .fetch(Source::Youtube, &endpoint, || {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(ms(50)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(i)
                    }
                })
                .await
        }
    });

    let results = join_all(requests).await;
    assert!(results.iter().all(|r| r.is_ok()));
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {} exceeded limit", peak);
    assert!(peak >= 2, "requests never overlapped");
}

#[tokio::test(start_paused = true)]
async fn retrying_request_does_not_hold_throttle_slot() {
    let mut config = config();
    config
        .throttle
        .insert("spotify".to_string(), ThrottleConfig::new(ms(10), 1, ms(500)));
    config.retry.insert(
        "spotify".to_string(),
        RetryOptions::new(ms(1), ms(100)).with_retry_delay(ms(1_000)),
    );
    let orchestrator = Orchestrator::new(config).unwrap();
    let start = tokio::time::Instant::now();

    let failing = async {
        let result: Result<u32, OrchestratorError<String>> = orchestrator
            .fetch(Source::Spotify, "tracks:1", || async {
                Err("502 Bad Gateway".to_string())
            })
            .await;
        (result, start.elapsed())
    };
    let queued = async {
        tokio::time::sleep(ms(20)).await;
        let result: Result<u32, OrchestratorError<String>> = orchestrator
            .fetch(Source::Spotify, "tracks:2", || async { Ok(2) })
            .await;
        (result, start.elapsed())
    };

    let ((failed, failed_at), (served, served_at)) = tokio::join!(failing, queued);

    // The failing request sleeps 1s and 2s between attempts without a slot.
    assert_eq!(
        failed.unwrap_err().into_upstream(),
        Some("502 Bad Gateway".to_string())
    );
    assert!(failed_at >= ms(3_000));
    assert_eq!(served.unwrap(), 2);
    assert!(served_at < ms(500), "queued request waited {:?}", served_at);
}
