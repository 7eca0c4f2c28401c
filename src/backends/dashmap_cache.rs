//! `DashMap` Cache - In-Process Concurrent Backend
//!
//! A lightweight in-memory cache using `DashMap` for concurrent access.
//! Used by tests and single-process deployments that do not need Redis.

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Cache entry with expiration tracking
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: &[u8], ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_vec(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() > expires_at)
    }
}

/// Simple concurrent cache using `DashMap`
///
/// **Features**:
/// - Lock-free concurrent reads/writes
/// - Per-key TTL, or no expiry at all
/// - Conditional set and compare-and-delete done under the shard lock,
///   so they are atomic with respect to other callers
///
/// **Limitations**:
/// - Expired entries are dropped lazily on access or by `cleanup_expired`
/// - Not shared between processes
///
/// **Example**:
/// ```rust
/// use gift_redemption::backends::DashMapCache;
/// use gift_redemption::traits::CacheBackend;
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let cache = DashMapCache::new();
///
/// cache.set_with_ttl("gift:A", b"{}", Some(Duration::from_secs(60))).await?;
/// assert_eq!(cache.get("gift:A").await?, Some(b"{}".to_vec()));
/// # Ok(())
/// # }
/// ```
pub struct DashMapCache {
    map: Arc<DashMap<String, CacheEntry>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    sets: Arc<AtomicU64>,
}

impl DashMapCache {
    /// Create new `DashMap` cache
    #[must_use]
    pub fn new() -> Self {
        info!("Initializing DashMap Cache (concurrent HashMap)");

        Self {
            map: Arc::new(DashMap::new()),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            sets: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cleanup expired entries
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.map.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "[DashMap] Cleaned up expired entries");
        }
        removed
    }

    /// Get current cache size (including not yet collected expired entries)
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// (hits, misses, sets)
    #[must_use]
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.sets.load(Ordering::Relaxed),
        )
    }
}

impl Default for DashMapCache {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Trait Implementations =====

use crate::traits::CacheBackend;
use async_trait::async_trait;

#[async_trait]
impl CacheBackend for DashMapCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.map.get(key) {
            if entry.is_expired() {
                drop(entry); // Release read lock
                self.map.remove_if(key, |_, e| e.is_expired());
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.value.clone()))
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.map.insert(key.to_string(), CacheEntry::new(value, ttl));
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = ?ttl.map(|t| t.as_secs()), "[DashMap] Cached key");
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let stored = match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(CacheEntry::new(value, ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value, ttl));
                true
            }
        };
        if stored {
            self.sets.fetch_add(1, Ordering::Relaxed);
        }
        Ok(stored)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let removed = self
            .map
            .remove_if(key, |_, entry| !entry.is_expired() && entry.value == expected)
            .is_some();
        Ok(removed)
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = self
            .map
            .iter()
            .filter(|item| item.key().starts_with(prefix) && !item.value().is_expired())
            .map(|item| item.key().clone())
            .collect();
        debug!(prefix = %prefix, count = keys.len(), "[DashMap] Scanned keys with prefix");
        Ok(keys)
    }

    async fn health_check(&self) -> bool {
        let test_key = "health_check_dashmap";
        let test_value = b"health_check_value";

        match self
            .set_with_ttl(test_key, test_value, Some(Duration::from_secs(60)))
            .await
        {
            Ok(()) => match self.get(test_key).await {
                Ok(Some(retrieved)) => {
                    let _ = self.remove(test_key).await;
                    retrieved == test_value
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "DashMap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_keeps_existing_value() {
        let cache = DashMapCache::new();
        assert!(cache.set_if_absent("k", b"first", None).await.unwrap());
        assert!(!cache.set_if_absent("k", b"second", None).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn test_set_if_absent_replaces_expired_value() {
        let cache = DashMapCache::new();
        cache
            .set_with_ttl("k", b"old", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.set_if_absent("k", b"new", None).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_remove_if_equals_only_matches_exact_value() {
        let cache = DashMapCache::new();
        cache.set_with_ttl("k", b"v1", None).await.unwrap();
        assert!(!cache.remove_if_equals("k", b"v0").await.unwrap());
        assert!(cache.get("k").await.unwrap().is_some());
        assert!(cache.remove_if_equals("k", b"v1").await.unwrap());
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(!cache.remove_if_equals("k", b"v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_keys_filters_prefix_and_expired() {
        let cache = DashMapCache::new();
        cache.set_with_ttl("gift:A", b"a", None).await.unwrap();
        cache
            .set_with_ttl("gift:B", b"b", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        cache.set_with_ttl("other:C", b"c", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let keys = cache.scan_keys("gift:").await.unwrap();
        assert_eq!(keys, vec!["gift:A".to_string()]);
        assert_eq!(cache.cleanup_expired(), 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        assert!(DashMapCache::new().health_check().await);
    }
}
