//! Cache Backend Implementations
//!
//! # Available Backends
//!
//! - **Redis** - Distributed cache, default for deployments (feature: `redis`)
//! - **`DashMap`** - In-process concurrent map, used by tests and the demo
//!
//! Both honour the full [`CacheBackend`](crate::traits::CacheBackend)
//! contract, including conditional set and compare-and-delete, which the
//! reconciler relies on.
//!
//! # Usage
//!
//! ```rust,no_run
//! use gift_redemption::backends::{DashMapCache, RedisCache};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let local = DashMapCache::new();
//! let shared = RedisCache::with_url("redis://localhost:6379", Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod dashmap_cache;

#[cfg(feature = "redis")]
pub mod redis_cache;

pub use dashmap_cache::DashMapCache;

#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;
