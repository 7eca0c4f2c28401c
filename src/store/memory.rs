//! Memory Store - In-Process Gift Table
//!
//! Mirrors the Postgres table closely enough for tests: sequential ids,
//! store-assigned timestamps and a unique constraint on `code`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::gift::{Gift, Page, PageRequest};
use crate::traits::GiftStore;

#[derive(Debug, Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, Gift>,
}

impl Table {
    fn id_for_code(&self, code: &str) -> Option<i64> {
        self.rows
            .values()
            .find(|g| g.code == code)
            .map(|g| g.id)
    }
}

/// In-memory gift table
#[derive(Debug, Default)]
pub struct MemoryGiftStore {
    table: Mutex<Table>,
}

impl MemoryGiftStore {
    #[must_use]
    pub fn new() -> Self {
        info!("Initializing in-memory gift store");
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl GiftStore for MemoryGiftStore {
    async fn insert(&self, gift: &Gift) -> Result<Gift, StoreError> {
        let mut table = self.table.lock();
        if table.id_for_code(&gift.code).is_some() {
            return Err(StoreError::DuplicateCode(gift.code.clone()));
        }

        table.next_id += 1;
        let now = Utc::now();
        let row = Gift {
            id: table.next_id,
            created_at: now,
            updated_at: now,
            ..gift.clone()
        };
        table.rows.insert(row.id, row.clone());
        debug!(id = row.id, code = %row.code, "[Memory] Inserted gift");
        Ok(row)
    }

    async fn update(&self, gift: &Gift) -> Result<DateTime<Utc>, StoreError> {
        let mut table = self.table.lock();
        if !table.rows.contains_key(&gift.id) {
            return Err(StoreError::NotFound);
        }
        if table
            .id_for_code(&gift.code)
            .is_some_and(|owner| owner != gift.id)
        {
            return Err(StoreError::DuplicateCode(gift.code.clone()));
        }

        let row = table.rows.get_mut(&gift.id).ok_or(StoreError::NotFound)?;
        let updated_at = Utc::now();
        *row = Gift {
            id: row.id,
            created_at: row.created_at,
            updated_at,
            ..gift.clone()
        };
        Ok(updated_at)
    }

    async fn select_by_code(&self, code: &str) -> Result<Option<Gift>, StoreError> {
        let table = self.table.lock();
        Ok(table
            .id_for_code(code)
            .and_then(|id| table.rows.get(&id))
            .cloned())
    }

    async fn select_by_id(&self, id: i64) -> Result<Option<Gift>, StoreError> {
        Ok(self.table.lock().rows.get(&id).cloned())
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.table
            .lock()
            .rows
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn delete_by_code(&self, code: &str) -> Result<(), StoreError> {
        let mut table = self.table.lock();
        let id = table.id_for_code(code).ok_or(StoreError::NotFound)?;
        table.rows.remove(&id);
        Ok(())
    }

    async fn select_page(&self, page: PageRequest) -> Result<Page, StoreError> {
        let table = self.table.lock();
        let mut rows: Vec<&Gift> = table.rows.values().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let items = rows
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        let total = page.with_total.then(|| table.rows.len() as u64);
        Ok(Page { items, total })
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
