//! Redis Cache - Distributed Cache Backend
//!
//! Redis-based cache for gift entries. Dirty entries are stored without
//! expiry, so the instance should run with AOF persistence enabled to keep
//! unflushed redemptions across a Redis restart.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Deletes KEYS[1] only while it still holds ARGV[1]
const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Redis cache with `ConnectionManager` for automatic reconnection
pub struct RedisCache {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
    compare_and_delete: Script,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    sets: Arc<AtomicU64>,
}

impl RedisCache {
    /// Create new Redis cache from the `REDIS_URL` environment variable
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn new() -> Result<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_url(&redis_url, Duration::from_secs(5)).await
    }

    /// Create new Redis cache with custom URL
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection string (e.g., `<redis://localhost:6379>`)
    /// * `timeout` - Upper bound for establishing the connection
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_url(redis_url: &str, timeout: Duration) -> Result<Self> {
        info!(redis_url = %redis_url, "Initializing Redis Cache with ConnectionManager");

        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {redis_url}"))?;

        let conn_manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .with_context(|| format!("Timed out connecting to Redis after {timeout:?}"))?
            .context("Failed to establish Redis connection manager")?;

        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING health check failed")?;

        info!(
            redis_url = %redis_url,
            "Redis Cache connected successfully (ConnectionManager enabled)"
        );

        Ok(Self {
            conn_manager,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            sets: Arc::new(AtomicU64::new(0)),
        })
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

/// Redis wants whole seconds; never round a TTL down to "no expiry"
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

// ===== Trait Implementations =====

use crate::traits::CacheBackend;
use async_trait::async_trait;

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();

        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .with_context(|| format!("Redis GET failed for key {key}"))?;
        match value {
            Some(bytes) if !bytes.is_empty() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(bytes))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn_manager.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Redis SET failed for key {key}"))?;

        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_secs = ?ttl.map(ttl_secs), "[Redis] Cached key");
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn_manager.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        // "OK" when written, nil when the key already existed
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Redis SET NX failed for key {key}"))?;

        let stored = reply.is_some();
        if stored {
            self.sets.fetch_add(1, Ordering::Relaxed);
        }
        Ok(stored)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(key)
            .await
            .with_context(|| format!("Redis DEL failed for key {key}"))?;
        Ok(())
    }

    async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Redis compare-and-delete failed for key {key}"))?;
        Ok(removed > 0)
    }

    /// Uses SCAN (cursor-based, non-blocking) rather than KEYS
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let result: (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("Redis SCAN failed for pattern {pattern}"))?;

            cursor = result.0;
            keys.extend(result.1);

            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once across iterations
        keys.sort_unstable();
        keys.dedup();

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn_manager.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
