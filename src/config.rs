//! Runtime configuration
//!
//! Defaults match production expectations; `from_env` lets a deployment
//! override each knob without a config file.

use std::time::Duration;

/// Knobs for the gift subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiftConfig {
    /// Redis connection string, read from `REDIS_URL`
    pub redis_url: String,

    /// Postgres connection string, read from `DATABASE_URL`
    pub database_url: String,

    /// Maximum pooled Postgres connections
    pub db_max_connections: u32,

    /// Upper bound for establishing cache and store connections
    pub connect_timeout: Duration,

    /// Pending redemptions allowed before `use_gift` callers are suspended
    pub queue_capacity: usize,

    /// How often dirty cache entries are flushed to the store
    pub reconcile_interval: Duration,

    /// Lifetime of read-through cache entries
    pub read_through_ttl: Duration,

    /// Namespace for gift cache keys
    pub key_prefix: String,

    /// Generated-code collisions tolerated before `create` gives up
    pub max_code_attempts: usize,
}

impl Default for GiftConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: "postgres://localhost:5432/gift".to_string(),
            db_max_connections: 10,
            connect_timeout: Duration::from_secs(5),
            queue_capacity: 100,
            reconcile_interval: Duration::from_secs(30),
            read_through_ttl: Duration::from_secs(600),
            key_prefix: "gift:".to_string(),
            max_code_attempts: 16,
        }
    }
}

impl GiftConfig {
    /// Build a config from environment variables, falling back to defaults
    ///
    /// Recognised variables: `REDIS_URL`, `DATABASE_URL`, `GIFT_DB_MAX_CONNECTIONS`,
    /// `GIFT_CONNECT_TIMEOUT_SECS`, `GIFT_QUEUE_CAPACITY`,
    /// `GIFT_RECONCILE_INTERVAL_SECS`, `GIFT_CACHE_TTL_SECS`, `GIFT_KEY_PREFIX`.
    /// Unparseable numbers fall back to the default as well.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |name: &str, default: u64| {
            lookup(name)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: u32::try_from(number(
                "GIFT_DB_MAX_CONNECTIONS",
                u64::from(defaults.db_max_connections),
            ))
            .unwrap_or(defaults.db_max_connections),
            connect_timeout: Duration::from_secs(number(
                "GIFT_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )),
            queue_capacity: usize::try_from(number(
                "GIFT_QUEUE_CAPACITY",
                defaults.queue_capacity as u64,
            ))
            .unwrap_or(defaults.queue_capacity)
            .max(1),
            reconcile_interval: Duration::from_secs(
                number(
                    "GIFT_RECONCILE_INTERVAL_SECS",
                    defaults.reconcile_interval.as_secs(),
                )
                .max(1),
            ),
            read_through_ttl: Duration::from_secs(
                number("GIFT_CACHE_TTL_SECS", defaults.read_through_ttl.as_secs()).max(1),
            ),
            key_prefix: lookup("GIFT_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            max_code_attempts: defaults.max_code_attempts,
        }
    }
}
