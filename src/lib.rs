//! Gift Redemption
//!
//! Cache-fronted gift code issuance and redemption featuring:
//! - **Cache-Aside Repository**: Redis (or any [`CacheBackend`]) in front of Postgres
//! - **Serialized Redemptions**: one worker task linearizes every check-and-increment
//! - **Deferred Durability**: redemptions land in the cache as dirty entries and
//!   a background reconciler flushes them to the store
//! - **Unique Code Generation**: `{prefix}-NNNNNN` codes with collision retry
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use gift_redemption::{CreateGiftRequest, GiftSystem};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let system = GiftSystem::in_memory().await?;
//!
//!     let gift = system.service().create(&CreateGiftRequest {
//!         code: Some("WELCOME10".to_string()),
//!         gift_amount: 1000,
//!         usage_limit: 1,
//!         expiration_date: "2030-12-31".to_string(),
//!         start_date_time: "2030-01-01".to_string(),
//!         ..CreateGiftRequest::default()
//!     }).await?;
//!
//!     let redeemed = system.service().use_gift(&gift.code).await?;
//!     tracing::info!(used = redeemed.used_count, "Redeemed");
//!
//!     system.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! use_gift ──► bounded queue ──► worker ──► cache: Dirty(gift)
//!                                                │
//!                              reconciler (30s) ─┴─► store.update ─► cache: Cached(gift)
//!
//! get_by_code ──► Dirty? ──► Cached? ──► store ──► populate Cached (10 min)
//! ```

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

pub mod backends;
pub mod builder;
pub mod codecs;
pub mod config;
pub mod error;
pub mod gift;
pub mod reconciler;
pub mod repository;
pub mod serializer;
pub mod service;
pub mod store;
pub mod traits;

pub use backends::DashMapCache;
#[cfg(feature = "redis")]
pub use backends::RedisCache;
pub use builder::GiftSystemBuilder;
pub use codecs::JsonCodec;
pub use config::GiftConfig;
pub use error::{ErrorBody, ErrorCode, GiftError, StoreError};
pub use gift::{CreateGiftRequest, Gift, Page, PageRequest, DATE_LAYOUT};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerStats};
pub use repository::{CacheState, FlushOutcome, GiftRepository, RepositoryStats};
pub use serializer::{RedemptionSerializer, SerializerStats};
pub use service::GiftService;
pub use store::MemoryGiftStore;
#[cfg(feature = "postgres")]
pub use store::PostgresGiftStore;
pub use traits::{CacheBackend, CacheCodec, GiftStore};

// Re-export async_trait for implementors of the backend traits
pub use async_trait::async_trait;

/// Main entry point: the gift service plus its background reconciler
///
/// # Example
///
/// ```rust,no_run
/// use gift_redemption::{GiftConfig, GiftSystem};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let system = GiftSystem::connect(GiftConfig::from_env()).await?;
///     if !system.health_check().await {
///         anyhow::bail!("gift backends unavailable");
///     }
///     system.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct GiftSystem {
    service: Arc<GiftService>,
    reconciler: Arc<Reconciler>,
    cache: Arc<dyn CacheBackend>,
    store: Arc<dyn GiftStore>,
}

impl GiftSystem {
    /// Connect the default backends described by `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the cache or the store cannot be reached.
    pub async fn connect(config: GiftConfig) -> Result<Self> {
        info!("Initializing gift system");
        GiftSystemBuilder::new().with_config(config).build().await
    }

    /// In-process backends only, for tests and demos
    ///
    /// # Errors
    ///
    /// Infallible in practice; returns `Result` to match [`Self::connect`].
    pub async fn in_memory() -> Result<Self> {
        GiftSystemBuilder::new()
            .with_cache(Arc::new(DashMapCache::new()))
            .with_store(Arc::new(MemoryGiftStore::new()))
            .build()
            .await
    }

    pub fn service(&self) -> &Arc<GiftService> {
        &self.service
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Check that both the cache and the store answer
    pub async fn health_check(&self) -> bool {
        let cache_ok = self.cache.health_check().await;
        let store_ok = self.store.health_check().await;

        if cache_ok && store_ok {
            info!("Gift system health check passed");
            true
        } else {
            warn!(cache_ok, store_ok, "Gift system health check failed");
            false
        }
    }

    /// Stop the reconciler and the redemption worker, then flush what is
    /// still dirty so the store holds every confirmed redemption.
    pub async fn shutdown(&self) {
        self.reconciler.shutdown().await;
        self.service.shutdown().await;
        match self.reconciler.run_once().await {
            Ok(report) if report.is_clean() => {
                info!(flushed = report.flushed, "Gift system shut down");
            }
            Ok(report) => {
                warn!(failed = report.failed, "Gift system shut down with dirty entries left");
            }
            Err(e) => error!(error = %e, "Final reconciliation failed"),
        }
    }
}
