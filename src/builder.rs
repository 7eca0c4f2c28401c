//! Gift System Builder
//!
//! Wires a cache backend, a durable store and a [`GiftConfig`] into a
//! running [`GiftSystem`].
//!
//! # Example: Default Backends
//!
//! ```rust,no_run
//! use gift_redemption::{GiftConfig, GiftSystemBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let system = GiftSystemBuilder::new()
//!         .with_config(GiftConfig::from_env())
//!         .build()
//!         .await?;
//!     system.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Custom Backends
//!
//! ```rust,ignore
//! use gift_redemption::GiftSystemBuilder;
//! use std::sync::Arc;
//!
//! let system = GiftSystemBuilder::new()
//!     .with_cache(Arc::new(MyCache::new()))
//!     .with_store(Arc::new(MyStore::new()))
//!     .build()
//!     .await?;
//! ```

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::GiftConfig;
use crate::reconciler::Reconciler;
use crate::repository::GiftRepository;
use crate::service::GiftService;
use crate::traits::{CacheBackend, GiftStore};
use crate::GiftSystem;

/// Builder for [`GiftSystem`]
///
/// # Default Behavior
///
/// Backends that are not supplied are created from the config:
/// - **cache**: Redis at `redis_url` (feature `redis`), else an in-process `DashMap`
/// - **store**: Postgres at `database_url` (feature `postgres`), else an in-memory table
///
/// The periodic reconciler is started unless
/// [`Self::without_background_reconcile`] was called.
pub struct GiftSystemBuilder {
    cache: Option<Arc<dyn CacheBackend>>,
    store: Option<Arc<dyn GiftStore>>,
    config: GiftConfig,
    background_reconcile: bool,
}

impl Default for GiftSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GiftSystemBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: None,
            store: None,
            config: GiftConfig::default(),
            background_reconcile: true,
        }
    }

    /// Use a custom cache backend
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a custom durable store
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn GiftStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: GiftConfig) -> Self {
        self.config = config;
        self
    }

    /// Leave reconciliation to explicit [`Reconciler::run_once`] calls
    #[must_use]
    pub fn without_background_reconcile(mut self) -> Self {
        self.background_reconcile = false;
        self
    }

    async fn default_cache(config: &GiftConfig) -> Result<Arc<dyn CacheBackend>> {
        #[cfg(feature = "redis")]
        {
            let cache =
                crate::backends::RedisCache::with_url(&config.redis_url, config.connect_timeout)
                    .await?;
            Ok(Arc::new(cache))
        }
        #[cfg(not(feature = "redis"))]
        {
            let _ = config;
            Ok(Arc::new(crate::backends::DashMapCache::new()))
        }
    }

    async fn default_store(config: &GiftConfig) -> Result<Arc<dyn GiftStore>> {
        #[cfg(feature = "postgres")]
        {
            let store = crate::store::PostgresGiftStore::connect(
                &config.database_url,
                config.db_max_connections,
                config.connect_timeout,
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        {
            let _ = config;
            Ok(Arc::new(crate::store::MemoryGiftStore::new()))
        }
    }

    /// Build the system, connecting default backends where needed
    ///
    /// Must be called from within a tokio runtime: the redemption worker and
    /// the reconciler are spawned here.
    ///
    /// # Errors
    ///
    /// Returns an error if a default backend cannot connect.
    pub async fn build(self) -> Result<GiftSystem> {
        let cache = match self.cache {
            Some(cache) => cache,
            None => Self::default_cache(&self.config).await?,
        };
        let store = match self.store {
            Some(store) => store,
            None => Self::default_store(&self.config).await?,
        };
        info!(cache = cache.name(), store = store.name(), "Building gift system");

        let repo = Arc::new(GiftRepository::with_config(
            Arc::clone(&cache),
            Arc::clone(&store),
            &self.config,
        ));
        let service = Arc::new(GiftService::new(Arc::clone(&repo), &self.config));
        let reconciler = Arc::new(Reconciler::new(repo, self.config.reconcile_interval));
        if self.background_reconcile {
            reconciler.start();
        }

        info!("Gift system initialized successfully");
        Ok(GiftSystem {
            service,
            reconciler,
            cache,
            store,
        })
    }
}
