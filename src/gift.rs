//! Gift model
//!
//! The canonical gift record plus the request and paging types that travel
//! through the service boundary.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GiftError;

/// Date layout accepted for `expirationDate` and `startDateTime`
pub const DATE_LAYOUT: &str = "%Y-%m-%d";

/// Canonical gift record
///
/// `id`, `created_at` and `updated_at` are assigned by the durable store.
/// The same shape is what gets written into the cache, so field names are
/// kept stable and human readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gift {
    pub id: i64,
    pub code: String,
    /// Amount in currency minor units
    pub gift_amount: i64,
    /// Maximum number of successful redemptions, 0 means unlimited
    pub usage_limit: i64,
    pub used_count: i64,
    pub expiration_date: DateTime<Utc>,
    pub start_date_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Gift {
    /// Build an unsaved gift. Store-assigned fields are zeroed.
    pub fn new(
        code: impl Into<String>,
        gift_amount: i64,
        usage_limit: i64,
        expiration_date: DateTime<Utc>,
        start_date_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            code: code.into(),
            gift_amount,
            usage_limit,
            used_count: 0,
            expiration_date,
            start_date_time,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.usage_limit == 0
    }

    /// Redemptions left before the limit is hit, `None` for unlimited gifts
    #[must_use]
    pub fn remaining_uses(&self) -> Option<i64> {
        if self.is_unlimited() {
            None
        } else {
            Some((self.usage_limit - self.used_count).max(0))
        }
    }

    /// Check the usage limit and count one redemption.
    ///
    /// Leaves the gift untouched when the limit is already reached.
    ///
    /// # Errors
    ///
    /// Returns [`GiftError::UsageLimitReached`] when `usage_limit > 0` and one
    /// more redemption would exceed it.
    pub fn redeem(&mut self) -> Result<(), GiftError> {
        if self.usage_limit > 0 && self.used_count + 1 > self.usage_limit {
            return Err(GiftError::UsageLimitReached(self.code.clone()));
        }
        self.used_count += 1;
        Ok(())
    }
}

/// Creation request as bound by the HTTP layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGiftRequest {
    /// Prefix for generated codes, ignored when `code` is given
    #[serde(default)]
    pub code_prefix: Option<String>,
    /// Literal code to use instead of a generated one
    #[serde(default)]
    pub code: Option<String>,
    pub gift_amount: i64,
    #[serde(default)]
    pub usage_limit: i64,
    /// `YYYY-MM-DD`
    pub expiration_date: String,
    /// `YYYY-MM-DD`
    pub start_date_time: String,
}

impl CreateGiftRequest {
    /// Validate the request and turn it into an unsaved gift.
    ///
    /// The code is left empty when none was supplied; the service fills it.
    ///
    /// # Errors
    ///
    /// Returns [`GiftError::InvalidRequest`] for negative amounts or limits
    /// and for dates that do not follow [`DATE_LAYOUT`].
    pub fn to_gift(&self) -> Result<Gift, GiftError> {
        if self.gift_amount < 0 {
            return Err(GiftError::invalid_request("giftAmount", "must not be negative"));
        }
        if self.usage_limit < 0 {
            return Err(GiftError::invalid_request("usageLimit", "must not be negative"));
        }
        let expiration_date = parse_date("expirationDate", &self.expiration_date)?;
        let start_date_time = parse_date("startDateTime", &self.start_date_time)?;

        let code = self
            .code
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();

        Ok(Gift::new(
            code,
            self.gift_amount,
            self.usage_limit,
            expiration_date,
            start_date_time,
        ))
    }

    /// The literal code, if one was supplied and is not blank
    #[must_use]
    pub fn literal_code(&self) -> Option<&str> {
        self.code.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

fn parse_date(field: &'static str, raw: &str) -> Result<DateTime<Utc>, GiftError> {
    let date = NaiveDate::parse_from_str(raw.trim(), DATE_LAYOUT)
        .map_err(|e| GiftError::invalid_request(field, format!("expected YYYY-MM-DD: {e}")))?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}

/// Limit/offset paging for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u32,
    /// Also compute the total row count
    pub with_total: bool,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            with_total: false,
        }
    }
}

/// One page of gifts, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Gift>,
    /// Present only when the request asked for it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}
