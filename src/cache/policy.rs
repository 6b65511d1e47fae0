//! Per-kind TTL selection for cached endpoint responses.

use std::collections::HashMap;
use std::time::Duration;

use super::DEFAULT_CACHE_TTL;

/// Built-in TTLs by endpoint kind. Search-like data goes stale quickly,
/// catalog data (albums, tracks) rarely changes.
const BUILTIN_KINDS: &[(&str, Duration)] = &[
    ("search", Duration::from_secs(30 * 60)),
    ("recent", Duration::from_secs(15 * 60)),
    ("recommendations", Duration::from_secs(24 * 60 * 60)),
    ("genres", Duration::from_secs(12 * 60 * 60)),
    ("artists", Duration::from_secs(6 * 60 * 60)),
    ("playlists", Duration::from_secs(4 * 60 * 60)),
    ("albums", Duration::from_secs(24 * 60 * 60)),
    ("tracks", Duration::from_secs(24 * 60 * 60)),
];

/// Picks a TTL from the kind prefix of an endpoint key (`"search:daft punk"`
/// has kind `search`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    default_ttl: Duration,
    by_kind: HashMap<String, Duration>,
}

impl TtlPolicy {
    /// A policy with no per-kind entries.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            by_kind: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: &str, ttl: Duration) -> Self {
        self.by_kind.insert(kind.to_string(), ttl);
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn kinds(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.by_kind.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// TTL for an endpoint key.
    pub fn ttl_for(&self, endpoint: &str) -> Duration {
        let kind = endpoint.split(':').next().unwrap_or(endpoint);
        self.by_kind
            .get(kind)
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        BUILTIN_KINDS
            .iter()
            .fold(Self::new(DEFAULT_CACHE_TTL), |policy, (kind, ttl)| {
                policy.with_kind(kind, *ttl)
            })
    }
}
