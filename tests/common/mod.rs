//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - In-memory system setup
//! - Test data generators
//! - Store wrappers that count, fail or pause writes

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gift_redemption::{
    CreateGiftRequest, DashMapCache, Gift, GiftConfig, GiftStore, GiftSystem, GiftSystemBuilder,
    MemoryGiftStore, Page, PageRequest, StoreError,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Create a unique gift code
pub fn test_code(name: &str) -> String {
    format!("{}_{}", name.to_uppercase(), rand::random::<u32>())
}

/// Creation request for a literal code
pub fn gift_request(code: &str, usage_limit: i64) -> CreateGiftRequest {
    CreateGiftRequest {
        code_prefix: None,
        code: Some(code.to_string()),
        gift_amount: 1000,
        usage_limit,
        expiration_date: "2030-12-31".to_string(),
        start_date_time: "2030-01-01".to_string(),
    }
}

/// Creation request with a generated code
pub fn prefixed_request(prefix: &str) -> CreateGiftRequest {
    CreateGiftRequest {
        code_prefix: Some(prefix.to_string()),
        code: None,
        ..gift_request("", 1)
    }
}

/// In-memory system; reconciliation only runs when a test asks for it
pub async fn setup_in_memory() -> GiftSystem {
    setup_with_store(Arc::new(MemoryGiftStore::new())).await
}

pub async fn setup_with_store(store: Arc<dyn GiftStore>) -> GiftSystem {
    init_tracing();
    GiftSystemBuilder::new()
        .with_cache(Arc::new(DashMapCache::new()))
        .with_store(store)
        .with_config(GiftConfig::default())
        .without_background_reconcile()
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build gift system: {e}"))
}

/// Row as currently held by the durable store
pub async fn stored(system: &GiftSystem, code: &str) -> Gift {
    system
        .service()
        .repository()
        .store()
        .select_by_code(code)
        .await
        .unwrap_or_else(|e| panic!("Store lookup failed: {e}"))
        .unwrap_or_else(|| panic!("No stored row for {code}"))
}

/// Memory store wrapper with test hooks
///
/// - counts every `update` and `insert`
/// - fails updates for codes in `failing`
/// - optionally parks the next update, or the next `select_by_code` after
///   it has read the row, until `resume` is notified
/// - can answer the next inserts with a unique-constraint violation, as if
///   the code belonged to a row the lookup did not see
#[derive(Default)]
pub struct InstrumentedStore {
    inner: MemoryGiftStore,
    pub updates: AtomicUsize,
    pub inserts: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    pause_next: AtomicBool,
    pause_next_select: AtomicBool,
    rejected_inserts: AtomicUsize,
    pub entered: Notify,
    pub resume: Notify,
}

impl InstrumentedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_updates_for(&self, code: &str) {
        self.failing.lock().insert(code.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    /// Park the next update after signalling `entered`
    pub fn pause_next_update(&self) {
        self.pause_next.store(true, Ordering::SeqCst);
    }

    /// Park the next `select_by_code` after it read the row
    pub fn pause_next_select(&self) {
        self.pause_next_select.store(true, Ordering::SeqCst);
    }

    /// Reject the next `count` inserts with `DuplicateCode`
    pub fn reject_next_inserts(&self, count: usize) {
        self.rejected_inserts.store(count, Ordering::SeqCst);
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GiftStore for InstrumentedStore {
    async fn insert(&self, gift: &Gift) -> Result<Gift, StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let rejected = self
            .rejected_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(StoreError::DuplicateCode(gift.code.clone()));
        }
        self.inner.insert(gift).await
    }

    async fn update(&self, gift: &Gift) -> Result<DateTime<Utc>, StoreError> {
        if self.pause_next.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.resume.notified().await;
        }
        if self.failing.lock().contains(&gift.code) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "injected update failure for {}",
                gift.code
            )));
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(gift).await
    }

    async fn select_by_code(&self, code: &str) -> Result<Option<Gift>, StoreError> {
        let row = self.inner.select_by_code(code).await?;
        if self.pause_next_select.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.resume.notified().await;
        }
        Ok(row)
    }

    async fn select_by_id(&self, id: i64) -> Result<Option<Gift>, StoreError> {
        self.inner.select_by_id(id).await
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn delete_by_code(&self, code: &str) -> Result<(), StoreError> {
        self.inner.delete_by_code(code).await
    }

    async fn select_page(&self, page: PageRequest) -> Result<Page, StoreError> {
        self.inner.select_page(page).await
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "Instrumented"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_generation() {
        let code1 = test_code("spring");
        let code2 = test_code("spring");
        assert_ne!(code1, code2, "Codes should be unique");
        assert!(code1.starts_with("SPRING_"));
    }
}
