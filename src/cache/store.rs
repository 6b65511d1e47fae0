//! Pluggable cache storage.

use std::time::Duration;

use async_trait::async_trait;

use super::TtlCache;

/// String key/value store with optional per-entry expiry.
///
/// [`TtlCache`] is the in-process implementation. Shared stores (Redis and
/// the like) can implement this to let several processes reuse upstream
/// responses.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Value for `key`, or `None` on a miss or an expired entry.
    async fn get(&self, key: &str) -> Option<String>;

    /// Store `value`, replacing any previous entry. `None` never expires.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>);

    /// Remove `key`. Removing a missing key is not an error.
    async fn del(&self, key: &str);
}

#[async_trait]
impl CacheStore for TtlCache {
    async fn get(&self, key: &str) -> Option<String> {
        TtlCache::get(self, key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        TtlCache::set(self, key, value, ttl).await
    }

    async fn del(&self, key: &str) {
        TtlCache::del(self, key).await
    }
}
