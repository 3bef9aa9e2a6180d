//! Short-lived in-memory cache of provider response bodies.
//!
//! One [`ResponseCache`] is shared (behind an `Arc`) by every provider client
//! in the process. Keys combine the provider, the endpoint and the serialized
//! filter set, so identical queries inside the TTL window reuse the first
//! upstream answer. Two concurrent misses for the same key may both go
//! upstream; the later write simply replaces the earlier one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

pub const DEFAULT_RESPONSE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CacheEntry {
    body: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct CacheInner {
    map: HashMap<String, CacheEntry>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ResponseCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                map: HashMap::new(),
                ttl,
            })),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn key(provider: &str, endpoint: &str, serialized_query: &str) -> String {
        format!("{provider}:{endpoint}:{serialized_query}")
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .map
            .get(key)
            .filter(|entry| Instant::now() <= entry.expires_at)
            .map(|entry| entry.body.clone())
    }

    /// Stores `body` and drops every entry whose TTL has run out, so the map
    /// only ever holds live responses.
    pub async fn put(&self, key: String, body: String) {
        let mut inner = self.inner.write().await;
        if inner.ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        inner.map.retain(|_, entry| entry.expires_at > now);
        let expires_at = now + inner.ttl;
        inner.map.insert(key, CacheEntry { body, expires_at });
    }

    /// Drops expired entries; returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.map.len();
        let now = Instant::now();
        inner.map.retain(|_, entry| entry.expires_at > now);
        before - inner.map.len()
    }

    /// Forgets everything. Called before a forced refresh.
    pub async fn clear(&self) {
        self.inner.write().await.map.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_TTL)
    }
}
