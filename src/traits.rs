//! Backend Traits
//!
//! This module defines the seams between the gift repository and the two
//! systems it sits in front of.
//!
//! # Architecture
//!
//! - `CacheCodec`: Trait for pluggable serialization of cached entries
//! - `CacheBackend`: Low-latency key/value cache (Redis, `DashMap`)
//! - `GiftStore`: Durable system of record for gifts (Postgres, in-memory)
//!
//! # Example: Custom Cache Backend
//!
//! ```rust,ignore
//! use gift_redemption::{CacheBackend, async_trait};
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyCache {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl CacheBackend for MyCache {
//!     async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> { todo!() }
//!     async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> { todo!() }
//!     async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool> { todo!() }
//!     async fn remove(&self, key: &str) -> Result<()> { todo!() }
//!     async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> { todo!() }
//!     async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> { todo!() }
//!     async fn health_check(&self) -> bool { todo!() }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::StoreError;
use crate::gift::{Gift, Page, PageRequest};

/// Trait for cache value serialization/deserialization
///
/// Implementations must be `Send + Sync + Debug` so a codec can be shared by
/// the repository, the redemption worker and the reconciler.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented by the codec.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding of `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Codec name used in logs
    fn name(&self) -> &'static str;
}

/// Key/value cache placed in front of the durable store
///
/// Unlike a plain cache this one carries state that is not yet durable, so a
/// backend must report I/O failures as errors instead of turning them into
/// misses. A miss read as "absent" would send the caller to a stale durable
/// row.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to support concurrent access across async tasks.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get value from cache by key
    ///
    /// # Returns
    ///
    /// * `Ok(Some(bytes))` - Value found
    /// * `Ok(None)` - Key not found or expired
    /// * `Err(e)` - Backend unreachable or command failed
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set value, replacing whatever is stored under `key`
    ///
    /// `ttl = None` stores the value without expiry.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Set value only if `key` holds nothing
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Value stored
    /// * `Ok(false)` - Key already held a value, nothing written
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>)
    -> Result<bool>;

    /// Remove value from cache (succeeds if the key did not exist)
    async fn remove(&self, key: &str) -> Result<()>;

    /// Compare-and-delete
    ///
    /// Removes `key` only while it still holds exactly `expected`.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Key removed
    /// * `Ok(false)` - Key missing or holding a different value, left untouched
    async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// List every live key starting with `prefix`
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Check if cache backend is healthy
    async fn health_check(&self) -> bool;

    /// Backend name used in logs
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Durable system of record for gifts
///
/// Lookups report absence as `Ok(None)`; writes that touch no row report
/// [`StoreError::NotFound`]. A violated code uniqueness constraint must be
/// reported as [`StoreError::DuplicateCode`] so callers can treat it as an
/// authoritative collision.
#[async_trait]
pub trait GiftStore: Send + Sync {
    /// Insert a new row and return it with `id`, `created_at` and
    /// `updated_at` filled in.
    async fn insert(&self, gift: &Gift) -> Result<Gift, StoreError>;

    /// Overwrite every mutable column of the row with `gift.id`.
    ///
    /// Returns the new `updated_at`.
    async fn update(&self, gift: &Gift) -> Result<chrono::DateTime<chrono::Utc>, StoreError>;

    async fn select_by_code(&self, code: &str) -> Result<Option<Gift>, StoreError>;

    async fn select_by_id(&self, id: i64) -> Result<Option<Gift>, StoreError>;

    async fn delete(&self, id: i64) -> Result<(), StoreError>;

    async fn delete_by_code(&self, code: &str) -> Result<(), StoreError>;

    /// Page through gifts, newest `created_at` first
    async fn select_page(&self, page: PageRequest) -> Result<Page, StoreError>;

    async fn health_check(&self) -> bool;

    fn name(&self) -> &'static str {
        "unknown"
    }
}
