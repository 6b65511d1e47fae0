//! In-memory TTL cache for upstream responses.
//!
//! Entries expire lazily: a read that finds an expired entry removes it and
//! reports a miss. [`TtlCache::cleanup`] sweeps everything expired in one
//! pass and is what the background sweeper calls. State is not persisted
//! across restarts.

mod policy;
mod store;

pub use policy::TtlPolicy;
pub use store::CacheStore;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default TTL for recommendation-style data (24 hours).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    /// `None` means the entry lives until deleted.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

/// Hit/miss statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed because they expired (lazily or by sweep).
    pub expired: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Key to string cache with optional per-entry expiry.
///
/// Cheap to clone; clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct TtlCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    counters: Arc<Counters>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key`, or `None` on miss or expiry.
    pub async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if !entry.is_expired(now) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: upgrade to a write lock. Another writer may have replaced the
        // entry in between, so check again before removing.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if !entry.is_expired(now) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            entries.remove(key);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `value` under `key`, overwriting any existing entry.
    pub async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    pub async fn del(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Remove every expired entry. Returns the number removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();

        if removed > 0 {
            self.counters
                .expired
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Cache cleanup removed {} expired entries", removed);
        }
        removed
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            entries: self.len().await,
        }
    }

    /// Spawn a task that calls [`cleanup`](Self::cleanup) every `interval`.
    ///
    /// The task runs until the returned handle is aborted. `interval` must be
    /// non-zero.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.cleanup().await;
            }
        })
    }

    #[cfg(test)]
    async fn contains_raw(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_del() {
        let cache = TtlCache::new();
        assert_eq!(cache.get("a").await, None);

        cache.set("a", "1".to_string(), None).await;
        assert_eq!(cache.get("a").await.as_deref(), Some("1"));

        cache.set("a", "2".to_string(), None).await;
        assert_eq!(cache.get("a").await.as_deref(), Some("2"));

        cache.del("a").await;
        cache.del("a").await;
        assert_eq!(cache.get("a").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_lazily() {
        let cache = TtlCache::new();
        cache
            .set("k", "v".to_string(), Some(Duration::from_millis(100)))
            .await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(101)).await;
        assert!(cache.contains_raw("k").await);
        assert_eq!(cache.get("k").await, None);
        assert!(!cache.contains_raw("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_without_ttl_never_expires() {
        let cache = TtlCache::new();
        cache.set("k", "v".to_string(), None).await;

        tokio::time::advance(Duration::from_secs(365 * 24 * 60 * 60)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_resets_expiry() {
        let cache = TtlCache::new();
        cache
            .set("k", "old".to_string(), Some(Duration::from_millis(50)))
            .await;
        cache.set("k", "new".to_string(), None).await;

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_counts_removed() {
        let cache = TtlCache::new();
        cache
            .set("short-1", "a".to_string(), Some(Duration::from_millis(10)))
            .await;
        cache
            .set("short-2", "b".to_string(), Some(Duration::from_millis(10)))
            .await;
        cache
            .set("long", "c".to_string(), Some(Duration::from_secs(10)))
            .await;
        cache.set("forever", "d".to_string(), None).await;

        assert_eq!(cache.cleanup().await, 0);
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(cache.cleanup().await, 2);
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.cleanup().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let cache = TtlCache::new();
        cache
            .set("k", "v".to_string(), Some(Duration::from_millis(10)))
            .await;
        cache.get("k").await;
        cache.get("missing").await;
        tokio::time::advance(Duration::from_millis(11)).await;
        cache.get("k").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.entries, 0);
        assert!((stats.hit_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired() {
        let cache = TtlCache::new();
        cache
            .set("k", "v".to_string(), Some(Duration::from_millis(10)))
            .await;
        let sweeper = cache.spawn_sweeper(Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.is_empty().await);
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let cache = TtlCache::new();
        let other = cache.clone();
        cache.set("k", "v".to_string(), None).await;
        assert_eq!(other.get("k").await.as_deref(), Some("v"));

        other.clear().await;
        assert!(cache.is_empty().await);
    }
}
