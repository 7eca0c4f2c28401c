//! Postgres Store - Canonical Gift Table
//!
//! Expects the following table (the unique index on `code` is what makes the
//! service's collision retry authoritative):
//!
//! ```sql
//! CREATE TABLE gift (
//!     id              BIGSERIAL PRIMARY KEY,
//!     code            TEXT        NOT NULL UNIQUE,
//!     gift_amount     BIGINT      NOT NULL,
//!     usage_limit     BIGINT      NOT NULL DEFAULT 0,
//!     used_count      BIGINT      NOT NULL DEFAULT 0,
//!     expiration_date TIMESTAMPTZ NOT NULL,
//!     start_date_time TIMESTAMPTZ NOT NULL,
//!     created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::gift::{Gift, Page, PageRequest};
use crate::traits::GiftStore;

const GIFT_COLUMNS: &str = "id, code, gift_amount, usage_limit, used_count, \
                            expiration_date, start_date_time, created_at, updated_at";

pub struct PostgresGiftStore {
    pool: Pool<Postgres>,
}

impl PostgresGiftStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be acquired within `timeout`.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        info!(max_connections, "Connecting gift store to Postgres");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

fn row_to_gift(r: &PgRow) -> Result<Gift, sqlx::Error> {
    Ok(Gift {
        id: r.try_get("id")?,
        code: r.try_get("code")?,
        gift_amount: r.try_get("gift_amount")?,
        usage_limit: r.try_get("usage_limit")?,
        used_count: r.try_get("used_count")?,
        expiration_date: r.try_get("expiration_date")?,
        start_date_time: r.try_get("start_date_time")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

/// Translate a driver error, lifting unique violations on `code`
fn map_err(err: sqlx::Error, code: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::DuplicateCode(code.to_string());
        }
    }
    StoreError::Backend(anyhow::Error::new(err))
}

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err))
}

#[async_trait]
impl GiftStore for PostgresGiftStore {
    async fn insert(&self, gift: &Gift) -> Result<Gift, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO gift (code, gift_amount, usage_limit, used_count, expiration_date, start_date_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {GIFT_COLUMNS}
            "#
        ))
            .bind(&gift.code)
            .bind(gift.gift_amount)
            .bind(gift.usage_limit)
            .bind(gift.used_count)
            .bind(gift.expiration_date)
            .bind(gift.start_date_time)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_err(e, &gift.code))?;

        let inserted = row_to_gift(&row).map_err(db_err)?;
        debug!(id = inserted.id, code = %inserted.code, "[Postgres] Inserted gift");
        Ok(inserted)
    }

    async fn update(&self, gift: &Gift) -> Result<DateTime<Utc>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE gift
            SET code = $1, gift_amount = $2, usage_limit = $3, used_count = $4,
                expiration_date = $5, start_date_time = $6, updated_at = now()
            WHERE id = $7
            RETURNING updated_at
            "#,
        )
            .bind(&gift.code)
            .bind(gift.gift_amount)
            .bind(gift.usage_limit)
            .bind(gift.used_count)
            .bind(gift.expiration_date)
            .bind(gift.start_date_time)
            .bind(gift.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err(e, &gift.code))?;

        match row {
            Some(r) => r.try_get("updated_at").map_err(db_err),
            None => Err(StoreError::NotFound),
        }
    }

    async fn select_by_code(&self, code: &str) -> Result<Option<Gift>, StoreError> {
        let row_opt = sqlx::query(&format!("SELECT {GIFT_COLUMNS} FROM gift WHERE code = $1"))
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row_opt.as_ref().map(row_to_gift).transpose().map_err(db_err)
    }

    async fn select_by_id(&self, id: i64) -> Result<Option<Gift>, StoreError> {
        let row_opt = sqlx::query(&format!("SELECT {GIFT_COLUMNS} FROM gift WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row_opt.as_ref().map(row_to_gift).transpose().map_err(db_err)
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM gift WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_by_code(&self, code: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM gift WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn select_page(&self, page: PageRequest) -> Result<Page, StoreError> {
        let total = if page.with_total {
            let count: i64 = sqlx::query_scalar("SELECT count(*) FROM gift")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
            Some(u64::try_from(count).unwrap_or_default())
        } else {
            None
        };

        let rows = sqlx::query(&format!(
            "SELECT {GIFT_COLUMNS} FROM gift ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        ))
            .bind(i64::from(page.limit))
            .bind(i64::from(page.offset))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut items = Vec::with_capacity(rows.len());
        for r in &rows {
            items.push(row_to_gift(r).map_err(db_err)?);
        }
        Ok(Page { items, total })
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    fn name(&self) -> &'static str {
        "Postgres"
    }
}
