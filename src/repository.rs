//! Cache-Aside Gift Repository
//!
//! Puts a low-latency cache in front of the durable gift store.
//!
//! # Cache state
//!
//! Each code owns exactly one cache key (`{prefix}{code}`) whose value is a
//! tagged entry:
//!
//! ```text
//! Absent                  nothing cached, the store is authoritative
//! Cached(gift, expiry)    read-through copy, disposable, TTL bounded
//! Dirty(gift)             confirmed redemption not yet in the store, no TTL
//! Deleted                 row just deleted or renamed away, TTL bounded
//! ```
//!
//! Because both states share one key, a dirty entry can never sit behind a
//! plain copy. Plain copies are only written with set-if-absent, so they never
//! clobber a dirty entry, and dirty entries are only cleared with
//! compare-and-delete, so a redemption that lands mid-flush survives. A
//! deletion marker occupies the key for one read-through TTL, so a reader
//! that fetched the row just before it was deleted cannot reinstall it.
//!
//! # Writers
//!
//! - redemption worker: `increase_used_count` (sole writer of dirty entries)
//! - reconciler and `update_direct`: flush, serialized by `flush_lock`
//! - readers: `get_by_code` read-through population

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codecs::JsonCodec;
use crate::config::GiftConfig;
use crate::error::{GiftError, StoreError};
use crate::gift::{Gift, Page, PageRequest};
use crate::traits::{CacheBackend, CacheCodec, GiftStore};

/// Serialized form of a cache value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
enum CacheEntry {
    Cached {
        gift: Gift,
        #[serde(rename = "expiresAt")]
        expires_at: DateTime<Utc>,
    },
    Dirty {
        gift: Gift,
    },
    Deleted,
}

/// What the cache currently holds for one code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheState {
    Absent,
    Cached {
        gift: Gift,
        expires_at: DateTime<Utc>,
    },
    Dirty(Gift),
}

impl CacheState {
    #[must_use]
    pub fn gift(&self) -> Option<&Gift> {
        match self {
            Self::Absent => None,
            Self::Cached { gift, .. } | Self::Dirty(gift) => Some(gift),
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        matches!(self, Self::Dirty(_))
    }
}

impl From<CacheEntry> for CacheState {
    fn from(entry: CacheEntry) -> Self {
        match entry {
            CacheEntry::Cached { gift, expires_at } => Self::Cached { gift, expires_at },
            CacheEntry::Dirty { gift } => Self::Dirty(gift),
            CacheEntry::Deleted => Self::Absent,
        }
    }
}

/// Result of flushing one cache key into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing dirty under the key
    Clean,
    /// Store updated and dirty entry cleared
    Flushed,
    /// Store updated but the entry changed meanwhile; it stays dirty
    Superseded,
    /// The row no longer exists; the dirty entry was dropped
    Orphaned,
}

/// Repository statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub dirty_hits: u64,
    pub cached_hits: u64,
    pub store_hits: u64,
    pub misses: u64,
    pub dirty_writes: u64,
    pub flushes: u64,
    pub discarded_dirty: u64,
}

#[derive(Debug, Default)]
struct AtomicRepositoryStats {
    dirty_hits: AtomicU64,
    cached_hits: AtomicU64,
    store_hits: AtomicU64,
    misses: AtomicU64,
    dirty_writes: AtomicU64,
    flushes: AtomicU64,
    discarded_dirty: AtomicU64,
}

impl AtomicRepositoryStats {
    fn snapshot(&self) -> RepositoryStats {
        RepositoryStats {
            dirty_hits: self.dirty_hits.load(Ordering::Relaxed),
            cached_hits: self.cached_hits.load(Ordering::Relaxed),
            store_hits: self.store_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            dirty_writes: self.dirty_writes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            discarded_dirty: self.discarded_dirty.load(Ordering::Relaxed),
        }
    }
}

/// Cache-aside repository over a [`CacheBackend`] and a [`GiftStore`]
pub struct GiftRepository<C: CacheCodec = JsonCodec> {
    cache: Arc<dyn CacheBackend>,
    store: Arc<dyn GiftStore>,
    codec: C,
    key_prefix: String,
    read_through_ttl: Duration,
    /// Serializes flushes against each other and against direct updates
    flush_lock: Mutex<()>,
    stats: AtomicRepositoryStats,
}

impl GiftRepository<JsonCodec> {
    /// Repository with the JSON codec and default settings
    pub fn new(cache: Arc<dyn CacheBackend>, store: Arc<dyn GiftStore>) -> Self {
        Self::with_codec(cache, store, JsonCodec, &GiftConfig::default())
    }

    pub fn with_config(
        cache: Arc<dyn CacheBackend>,
        store: Arc<dyn GiftStore>,
        config: &GiftConfig,
    ) -> Self {
        Self::with_codec(cache, store, JsonCodec, config)
    }
}

impl<C: CacheCodec> GiftRepository<C> {
    pub fn with_codec(
        cache: Arc<dyn CacheBackend>,
        store: Arc<dyn GiftStore>,
        codec: C,
        config: &GiftConfig,
    ) -> Self {
        info!(
            cache = cache.name(),
            store = store.name(),
            codec = codec.name(),
            "Initializing cache-aside gift repository"
        );
        Self {
            cache,
            store,
            codec,
            key_prefix: config.key_prefix.clone(),
            read_through_ttl: config.read_through_ttl,
            flush_lock: Mutex::new(()),
            stats: AtomicRepositoryStats::default(),
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn GiftStore> {
        &self.store
    }

    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    #[must_use]
    pub fn key(&self, code: &str) -> String {
        format!("{}{code}", self.key_prefix)
    }

    #[must_use]
    pub fn stats(&self) -> RepositoryStats {
        self.stats.snapshot()
    }

    // ===== Cache state =====

    /// Read and decode the entry under `key`, keeping the raw bytes for
    /// compare-and-delete.
    async fn load_entry(&self, key: &str) -> Result<Option<(CacheEntry, Vec<u8>)>, GiftError> {
        let Some(raw) = self
            .cache
            .get(key)
            .await
            .map_err(|e| GiftError::cache("get", e))?
        else {
            return Ok(None);
        };
        let entry = self
            .codec
            .deserialize::<CacheEntry>(&raw)
            .map_err(|e| GiftError::cache("decode", e.context(format!("key {key}"))))?;
        Ok(Some((entry, raw)))
    }

    fn encode(&self, entry: &CacheEntry) -> Result<Vec<u8>, GiftError> {
        self.codec
            .serialize(entry)
            .map_err(|e| GiftError::cache("encode", e))
    }

    /// Current cache state for `code`; a deletion marker reads as `Absent`
    ///
    /// # Errors
    ///
    /// Returns [`GiftError::Cache`] if the cache is unreachable or holds an
    /// entry the codec cannot decode.
    pub async fn cache_state(&self, code: &str) -> Result<CacheState, GiftError> {
        Ok(self
            .load_entry(&self.key(code))
            .await?
            .map_or(CacheState::Absent, |(entry, _)| entry.into()))
    }

    fn cached_entry(&self, gift: Gift) -> CacheEntry {
        let ttl =
            chrono::Duration::from_std(self.read_through_ttl).unwrap_or(chrono::Duration::zero());
        CacheEntry::Cached {
            gift,
            expires_at: Utc::now() + ttl,
        }
    }

    /// Install a read-through copy unless something is already cached.
    /// Failures only cost a future cache miss, so they are logged.
    async fn populate(&self, gift: &Gift) {
        let entry = self.cached_entry(gift.clone());
        let key = self.key(&gift.code);
        let result = match self.encode(&entry) {
            Ok(bytes) => self
                .cache
                .set_if_absent(&key, &bytes, Some(self.read_through_ttl))
                .await
                .map_err(|e| GiftError::cache("populate", e)),
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => debug!(key = %key, "Populated read-through gift entry"),
            Ok(false) => debug!(key = %key, "Read-through skipped, key already cached"),
            Err(e) => warn!(key = %key, error = %e, "Failed to populate read-through gift entry"),
        }
    }

    /// Replace the returned gift with its dirty entry, if one exists
    async fn overlay_dirty(&self, gift: Gift) -> Result<Gift, GiftError> {
        match self.cache_state(&gift.code).await? {
            CacheState::Dirty(dirty) => Ok(dirty),
            _ => Ok(gift),
        }
    }

    // ===== Lookups =====

    /// Look up a gift by code: dirty entry, then read-through copy, then store
    ///
    /// A store hit is cached for the read-through TTL.
    ///
    /// # Errors
    ///
    /// - [`GiftError::InvalidGiftCode`] when no stage knows the code
    /// - [`GiftError::Cache`] / [`GiftError::Store`] on I/O failures
    pub async fn get_by_code(&self, code: &str) -> Result<Gift, GiftError> {
        match self.cache_state(code).await? {
            CacheState::Dirty(gift) => {
                self.stats.dirty_hits.fetch_add(1, Ordering::Relaxed);
                Ok(gift)
            }
            CacheState::Cached { gift, .. } => {
                self.stats.cached_hits.fetch_add(1, Ordering::Relaxed);
                Ok(gift)
            }
            CacheState::Absent => {
                let Some(gift) = self
                    .store
                    .select_by_code(code)
                    .await
                    .map_err(|e| GiftError::store("select_by_code", e))?
                else {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return Err(GiftError::InvalidGiftCode(code.to_string()));
                };
                self.stats.store_hits.fetch_add(1, Ordering::Relaxed);
                self.populate(&gift).await;
                Ok(gift)
            }
        }
    }

    /// Look up a gift by id. The store row is authoritative for existence;
    /// an unflushed dirty entry still wins for the values.
    ///
    /// # Errors
    ///
    /// [`GiftError::InvalidGiftId`] when no row has this id.
    pub async fn get_by_id(&self, id: i64) -> Result<Gift, GiftError> {
        let gift = self.select_existing(id).await?;
        self.overlay_dirty(gift).await
    }

    /// Page through gifts, newest first, with dirty entries overlaid
    ///
    /// # Errors
    ///
    /// Returns an error on store or cache failures.
    pub async fn list(&self, page: PageRequest) -> Result<Page, GiftError> {
        let Page { items, total } = self
            .store
            .select_page(page)
            .await
            .map_err(|e| GiftError::store("select_page", e))?;

        let mut overlaid = Vec::with_capacity(items.len());
        for gift in items {
            overlaid.push(self.overlay_dirty(gift).await?);
        }
        Ok(Page {
            items: overlaid,
            total,
        })
    }

    // ===== Writes =====

    /// Insert a new gift
    ///
    /// # Errors
    ///
    /// [`GiftError::DuplicateGiftCode`] if the store already holds the code.
    pub async fn create(&self, gift: &Gift) -> Result<Gift, GiftError> {
        let created = self.store.insert(gift).await.map_err(|e| match e {
            StoreError::DuplicateCode(code) => GiftError::DuplicateGiftCode(code),
            other => GiftError::store("insert", other),
        })?;

        // Re-created code: the marker left by an earlier delete can go
        let marker = self.encode(&CacheEntry::Deleted)?;
        self.cache
            .remove_if_equals(&self.key(&created.code), &marker)
            .await
            .map_err(|e| GiftError::cache("remove_if_equals", e))?;

        info!(id = created.id, code = %created.code, "Created gift");
        Ok(created)
    }

    /// Insert gifts one by one, stopping at the first failure
    ///
    /// # Errors
    ///
    /// Returns the first insert error; earlier inserts are kept.
    pub async fn create_bulk(&self, gifts: &[Gift]) -> Result<Vec<Gift>, GiftError> {
        let mut created = Vec::with_capacity(gifts.len());
        for gift in gifts {
            created.push(self.create(gift).await?);
        }
        Ok(created)
    }

    /// Plain full-row store write, no cache interaction
    ///
    /// # Errors
    ///
    /// Returns an error if the row is missing or the store fails.
    pub async fn update(&self, gift: &Gift) -> Result<Gift, GiftError> {
        let updated_at = self.store.update(gift).await.map_err(|e| match e {
            StoreError::NotFound => GiftError::InvalidGiftId(gift.id),
            StoreError::DuplicateCode(code) => GiftError::DuplicateGiftCode(code),
            other => GiftError::store("update", other),
        })?;
        Ok(Gift {
            updated_at,
            ..gift.clone()
        })
    }

    /// Check the usage limit and count one redemption in the cache
    ///
    /// The current value comes from the dirty entry if there is one, else
    /// from the store. Read-through copies are skipped: they may predate a
    /// flush and would let a stale `used_count` become dirty.
    ///
    /// This is a read-modify-write without any cache-side atomicity. Only the
    /// redemption worker may call it.
    pub(crate) async fn increase_used_count(&self, code: &str) -> Result<Gift, GiftError> {
        let key = self.key(code);
        let mut gift = match self.load_entry(&key).await? {
            Some((CacheEntry::Dirty { gift }, _)) => gift,
            _ => self
                .store
                .select_by_code(code)
                .await
                .map_err(|e| GiftError::store("select_by_code", e))?
                .ok_or_else(|| GiftError::InvalidGiftCode(code.to_string()))?,
        };

        gift.redeem()?;

        let bytes = self.encode(&CacheEntry::Dirty { gift: gift.clone() })?;
        self.cache
            .set_with_ttl(&key, &bytes, None)
            .await
            .map_err(|e| GiftError::cache("set_dirty", e))?;
        self.stats.dirty_writes.fetch_add(1, Ordering::Relaxed);
        debug!(code = %code, used_count = gift.used_count, "Recorded redemption in cache");
        Ok(gift)
    }

    /// Administrative full-row update
    ///
    /// Flushes any dirty entry for the gift first so the write starts from
    /// the latest confirmed state, then writes the store and replaces the
    /// cached copy with the new row. Redemptions must not run concurrently for
    /// the same code; the service routes this through the redemption worker.
    ///
    /// `used_count` never goes down: the written value is the larger of the
    /// flushed row's count and `gift.used_count`.
    ///
    /// # Errors
    ///
    /// - [`GiftError::InvalidGiftId`] when `gift.id` has no row
    /// - [`GiftError::InvalidRequest`] when a finite `usage_limit` is below
    ///   the redemptions already made
    /// - [`GiftError::DuplicateGiftCode`] when renaming onto a taken code
    /// - flush, store or cache failures; nothing is written if the flush fails
    pub(crate) async fn update_direct(&self, gift: &Gift) -> Result<Gift, GiftError> {
        let _guard = self.flush_lock.lock().await;

        let existing = self.select_existing(gift.id).await?;
        let outcome = self.flush_key_locked(&self.key(&existing.code)).await?;
        debug!(code = %existing.code, ?outcome, "Flushed before direct update");
        let current = match outcome {
            FlushOutcome::Clean => existing,
            _ => self.select_existing(gift.id).await?,
        };

        let used_count = current.used_count.max(gift.used_count);
        if gift.usage_limit > 0 && gift.usage_limit < used_count {
            return Err(GiftError::invalid_request(
                "usageLimit",
                format!(
                    "{} is below the {used_count} redemptions already made",
                    gift.usage_limit
                ),
            ));
        }

        let mut updated = self
            .update(&Gift {
                used_count,
                ..gift.clone()
            })
            .await?;
        updated.created_at = current.created_at;

        if current.code != updated.code {
            self.mark_deleted(&current.code).await?;
        }

        let bytes = self.encode(&self.cached_entry(updated.clone()))?;
        self.cache
            .set_with_ttl(&self.key(&updated.code), &bytes, Some(self.read_through_ttl))
            .await
            .map_err(|e| GiftError::cache("set_cached", e))?;

        info!(id = updated.id, code = %updated.code, "Updated gift directly in store");
        Ok(updated)
    }

    async fn select_existing(&self, id: i64) -> Result<Gift, GiftError> {
        self.store
            .select_by_id(id)
            .await
            .map_err(|e| GiftError::store("select_by_id", e))?
            .ok_or(GiftError::InvalidGiftId(id))
    }

    // ===== Deletes =====

    /// Replace whatever is cached for `code` with a deletion marker.
    ///
    /// Called once the row is gone from the store, so any read-through copy
    /// fetched before the delete finds the key taken. A dirty entry is
    /// discarded together with the gift: the redemptions it records die with
    /// the row.
    async fn mark_deleted(&self, code: &str) -> Result<(), GiftError> {
        let key = self.key(code);
        if let Some((CacheEntry::Dirty { gift }, _)) = self.load_entry(&key).await? {
            self.stats.discarded_dirty.fetch_add(1, Ordering::Relaxed);
            warn!(
                code = %code,
                used_count = gift.used_count,
                "Discarding unflushed redemptions of deleted gift"
            );
        }
        let marker = self.encode(&CacheEntry::Deleted)?;
        self.cache
            .set_with_ttl(&key, &marker, Some(self.read_through_ttl))
            .await
            .map_err(|e| GiftError::cache("mark_deleted", e))
    }

    /// # Errors
    ///
    /// [`GiftError::InvalidGiftId`] when no row has this id.
    pub async fn delete(&self, id: i64) -> Result<(), GiftError> {
        let gift = self.select_existing(id).await?;
        self.store.delete(id).await.map_err(|e| match e {
            StoreError::NotFound => GiftError::InvalidGiftId(id),
            other => GiftError::store("delete", other),
        })?;
        self.mark_deleted(&gift.code).await?;
        info!(id, code = %gift.code, "Deleted gift");
        Ok(())
    }

    /// # Errors
    ///
    /// [`GiftError::InvalidGiftCode`] when no row has this code.
    pub async fn delete_by_code(&self, code: &str) -> Result<(), GiftError> {
        self.store.delete_by_code(code).await.map_err(|e| match e {
            StoreError::NotFound => GiftError::InvalidGiftCode(code.to_string()),
            other => GiftError::store("delete_by_code", other),
        })?;
        self.mark_deleted(code).await?;
        info!(code = %code, "Deleted gift");
        Ok(())
    }

    /// # Errors
    ///
    /// Stops at and returns the first failure.
    pub async fn delete_bulk_by_ids(&self, ids: &[i64]) -> Result<(), GiftError> {
        for &id in ids {
            self.delete(id).await?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Stops at and returns the first failure.
    pub async fn delete_bulk_by_codes(&self, codes: &[String]) -> Result<(), GiftError> {
        for code in codes {
            self.delete_by_code(code).await?;
        }
        Ok(())
    }

    // ===== Reconciliation =====

    /// Every live key under the gift prefix, clean or dirty
    ///
    /// # Errors
    ///
    /// Returns an error if the cache scan fails.
    pub async fn scan_keys(&self) -> Result<Vec<String>, GiftError> {
        self.cache
            .scan_keys(&self.key_prefix)
            .await
            .map_err(|e| GiftError::cache("scan_keys", e))
    }

    /// Flush the entry under `key` into the store if it is dirty
    ///
    /// Safe to repeat: the store write is a full-row overwrite and the entry
    /// is only cleared if it still holds the flushed bytes.
    ///
    /// # Errors
    ///
    /// Returns cache or store failures; the entry stays dirty in that case.
    pub async fn flush_key(&self, key: &str) -> Result<FlushOutcome, GiftError> {
        let _guard = self.flush_lock.lock().await;
        self.flush_key_locked(key).await
    }

    /// Flush the dirty entry for `code`, if any
    ///
    /// # Errors
    ///
    /// See [`Self::flush_key`].
    pub async fn flush_code(&self, code: &str) -> Result<FlushOutcome, GiftError> {
        self.flush_key(&self.key(code)).await
    }

    async fn flush_key_locked(&self, key: &str) -> Result<FlushOutcome, GiftError> {
        let Some((CacheEntry::Dirty { gift }, raw)) = self.load_entry(key).await? else {
            return Ok(FlushOutcome::Clean);
        };

        let updated_at = match self.store.update(&gift).await {
            Ok(updated_at) => updated_at,
            Err(StoreError::NotFound) => {
                // Row deleted while a redemption was in flight
                let dropped = self
                    .cache
                    .remove_if_equals(key, &raw)
                    .await
                    .map_err(|e| GiftError::cache("remove_if_equals", e))?;
                warn!(
                    key = %key,
                    dropped,
                    used_count = gift.used_count,
                    "Dropped dirty entry of missing gift"
                );
                return Ok(FlushOutcome::Orphaned);
            }
            Err(e) => return Err(GiftError::store("update", e)),
        };

        let cleared = self
            .cache
            .remove_if_equals(key, &raw)
            .await
            .map_err(|e| GiftError::cache("remove_if_equals", e))?;
        if !cleared {
            debug!(key = %key, "Dirty entry changed during flush, keeping it for the next run");
            return Ok(FlushOutcome::Superseded);
        }

        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.populate(&Gift { updated_at, ..gift }).await;
        Ok(FlushOutcome::Flushed)
    }
}
