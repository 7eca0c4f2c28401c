//! Gift Service
//!
//! Entry point for callers: creation with unique code generation, lookups,
//! redemption through the serializer and administrative updates and deletes.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::codecs::JsonCodec;
use crate::config::GiftConfig;
use crate::error::GiftError;
use crate::gift::{CreateGiftRequest, Gift, Page, PageRequest};
use crate::repository::GiftRepository;
use crate::serializer::{RedemptionSerializer, SerializerStats};
use crate::traits::CacheCodec;

const SUFFIX_SPACE: u32 = 1_000_000;

/// Time-derived code suffixes, unique within the process
///
/// The suffix is the current microsecond modulo one million. The clock reading
/// is kept strictly increasing across calls, so two calls in the same
/// microsecond still get different suffixes.
#[derive(Debug, Default)]
pub(crate) struct CodeGenerator {
    last_micros: Mutex<i64>,
}

impl CodeGenerator {
    pub(crate) fn next_code(&self, prefix: &str) -> String {
        let now = Utc::now().timestamp_micros();
        let micros = {
            let mut last = self.last_micros.lock();
            *last = now.max(*last + 1);
            *last
        };
        let suffix = micros.rem_euclid(i64::from(SUFFIX_SPACE));

        if prefix.is_empty() {
            format!("{suffix:06}")
        } else {
            format!("{prefix}-{suffix:06}")
        }
    }
}

/// Gift operations backed by a cache-aside repository
pub struct GiftService<C: CacheCodec + 'static = JsonCodec> {
    repo: Arc<GiftRepository<C>>,
    serializer: RedemptionSerializer,
    codes: CodeGenerator,
    max_code_attempts: usize,
}

impl<C: CacheCodec + 'static> GiftService<C> {
    /// Create the service and start its redemption worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(repo: Arc<GiftRepository<C>>, config: &GiftConfig) -> Self {
        let serializer = RedemptionSerializer::start(Arc::clone(&repo), config.queue_capacity);
        Self {
            repo,
            serializer,
            codes: CodeGenerator::default(),
            max_code_attempts: config.max_code_attempts.max(1),
        }
    }

    pub fn repository(&self) -> &Arc<GiftRepository<C>> {
        &self.repo
    }

    #[must_use]
    pub fn serializer_stats(&self) -> SerializerStats {
        self.serializer.stats()
    }

    /// Create a gift from a request
    ///
    /// A literal `code` is used as is. Otherwise a `{prefix}-NNNNNN` code is
    /// generated, checked against the repository and inserted; a collision at
    /// either step draws a new code, up to `max_code_attempts` times.
    ///
    /// # Errors
    ///
    /// - [`GiftError::InvalidRequest`] for malformed input
    /// - [`GiftError::DuplicateGiftCode`] when a literal code is taken
    /// - [`GiftError::CodeSpaceExhausted`] when every generated code collided
    pub async fn create(&self, req: &CreateGiftRequest) -> Result<Gift, GiftError> {
        let mut gift = req.to_gift()?;

        if let Some(code) = req.literal_code() {
            gift.code = code.to_string();
            return self.repo.create(&gift).await;
        }

        let prefix = req.code_prefix.as_deref().map_or("", str::trim);
        for attempt in 1..=self.max_code_attempts {
            let candidate = self.codes.next_code(prefix);

            match self.repo.get_by_code(&candidate).await {
                Ok(_) => {
                    debug!(code = %candidate, attempt, "Generated gift code already in use");
                    continue;
                }
                Err(GiftError::InvalidGiftCode(_)) => {}
                Err(e) => return Err(e),
            }

            gift.code = candidate;
            match self.repo.create(&gift).await {
                Ok(created) => return Ok(created),
                Err(GiftError::DuplicateGiftCode(code)) => {
                    debug!(code = %code, attempt, "Store rejected generated gift code");
                }
                Err(e) => return Err(e),
            }
        }

        Err(GiftError::CodeSpaceExhausted(self.max_code_attempts))
    }

    /// Create several gifts, stopping at the first failure
    ///
    /// # Errors
    ///
    /// Returns the first failure; gifts created before it are kept.
    pub async fn create_bulk(&self, reqs: &[CreateGiftRequest]) -> Result<Vec<Gift>, GiftError> {
        let mut created = Vec::with_capacity(reqs.len());
        for req in reqs {
            created.push(self.create(req).await?);
        }
        info!(count = created.len(), "Created gifts in bulk");
        Ok(created)
    }

    /// # Errors
    ///
    /// [`GiftError::InvalidGiftCode`] for unknown codes, or I/O failures.
    pub async fn get_by_code(&self, code: &str) -> Result<Gift, GiftError> {
        self.repo.get_by_code(code).await
    }

    /// # Errors
    ///
    /// [`GiftError::InvalidGiftId`] for unknown ids, or I/O failures.
    pub async fn get_by_id(&self, id: i64) -> Result<Gift, GiftError> {
        self.repo.get_by_id(id).await
    }

    /// # Errors
    ///
    /// Returns cache or store failures.
    pub async fn list(&self, page: PageRequest) -> Result<Page, GiftError> {
        self.repo.list(page).await
    }

    /// Redeem `code` once
    ///
    /// The returned gift already counts this redemption. It is durable in the
    /// cache at once and in the store after the next reconciliation run.
    ///
    /// # Errors
    ///
    /// - [`GiftError::InvalidGiftCode`] / [`GiftError::UsageLimitReached`]
    /// - [`GiftError::WorkerStopped`] after [`Self::shutdown`]
    pub async fn use_gift(&self, code: &str) -> Result<Gift, GiftError> {
        self.serializer.redeem(code).await
    }

    /// Overwrite the gift with `gift.id` with every field of `gift`
    ///
    /// Pending redemptions are flushed first and `used_count` never goes
    /// below the flushed value. The update runs on the redemption worker so
    /// no redemption interleaves with it.
    ///
    /// # Errors
    ///
    /// [`GiftError::InvalidGiftId`], [`GiftError::InvalidRequest`] for a
    /// limit below the redemptions made, [`GiftError::DuplicateGiftCode`] or
    /// I/O failures.
    pub async fn update_by_code(&self, gift: Gift) -> Result<Gift, GiftError> {
        self.serializer.update(gift).await
    }

    /// Delete a gift by code, discarding unflushed redemptions
    ///
    /// # Errors
    ///
    /// [`GiftError::InvalidGiftCode`] for unknown codes, or I/O failures.
    pub async fn delete_by_code(&self, code: &str) -> Result<(), GiftError> {
        self.repo.delete_by_code(code).await
    }

    /// # Errors
    ///
    /// [`GiftError::InvalidGiftId`] for unknown ids, or I/O failures.
    pub async fn delete(&self, id: i64) -> Result<(), GiftError> {
        self.repo.delete(id).await
    }

    /// # Errors
    ///
    /// Stops at and returns the first failure.
    pub async fn delete_bulk_by_ids(&self, ids: &[i64]) -> Result<(), GiftError> {
        self.repo.delete_bulk_by_ids(ids).await
    }

    /// # Errors
    ///
    /// Stops at and returns the first failure.
    pub async fn delete_bulk_by_codes(&self, codes: &[String]) -> Result<(), GiftError> {
        self.repo.delete_bulk_by_codes(codes).await
    }

    /// Stop the redemption worker after it answers every queued request
    pub async fn shutdown(&self) {
        self.serializer.shutdown().await;
    }
}
