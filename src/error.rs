//! Error taxonomy
//!
//! [`GiftError`] is what the service hands to callers. Every variant maps to a
//! stable [`ErrorCode`] for programmatic handling and to an HTTP-style status
//! so the boundary layer does not have to re-classify anything.

use serde::Serialize;
use thiserror::Error;

/// Stable error codes exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Internal,
    InvalidGiftId,
    InvalidGiftCode,
    InvalidRequest,
    DuplicateGiftCode,
    GiftUsageLimitReached,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "INTERNAL",
            Self::InvalidGiftId => "INVALID_GIFT_ID",
            Self::InvalidGiftCode => "INVALID_GIFT_CODE",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::DuplicateGiftCode => "DUPLICATE_GIFT_CODE",
            Self::GiftUsageLimitReached => "GIFT_USAGE_LIMIT_REACHED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable store failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// Update or delete touched no row
    #[error("no row to update")]
    NotFound,

    /// The unique constraint on `code` rejected the write
    #[error("gift code {0} already exists")]
    DuplicateCode(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Errors returned by the gift service and repository
#[derive(Debug, Error)]
pub enum GiftError {
    #[error("invalid gift code: {0}")]
    InvalidGiftCode(String),

    #[error("invalid gift id: {0}")]
    InvalidGiftId(i64),

    #[error("gift usage limit reached: {0}")]
    UsageLimitReached(String),

    #[error("gift code already exists: {0}")]
    DuplicateGiftCode(String),

    #[error("invalid {field}: {message}")]
    InvalidRequest {
        field: &'static str,
        message: String,
    },

    #[error("could not allocate a unique gift code after {0} attempts")]
    CodeSpaceExhausted(usize),

    #[error("redemption worker is not running")]
    WorkerStopped,

    #[error("durable store failure during {op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("cache failure during {op}: {source}")]
    Cache {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl GiftError {
    pub fn invalid_request(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            field,
            message: message.into(),
        }
    }

    pub(crate) fn store(op: &'static str, source: StoreError) -> Self {
        Self::Store { op, source }
    }

    pub(crate) fn cache(op: &'static str, source: anyhow::Error) -> Self {
        Self::Cache { op, source }
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidGiftCode(_) => ErrorCode::InvalidGiftCode,
            Self::InvalidGiftId(_) => ErrorCode::InvalidGiftId,
            Self::UsageLimitReached(_) => ErrorCode::GiftUsageLimitReached,
            Self::DuplicateGiftCode(_) => ErrorCode::DuplicateGiftCode,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::CodeSpaceExhausted(_)
            | Self::WorkerStopped
            | Self::Store { .. }
            | Self::Cache { .. } => ErrorCode::Internal,
        }
    }

    /// Client faults are never retried automatically
    #[must_use]
    pub fn is_client_fault(&self) -> bool {
        self.code() != ErrorCode::Internal
    }

    /// HTTP status the boundary layer should answer with
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self.code() {
            ErrorCode::InvalidGiftId
            | ErrorCode::InvalidGiftCode
            | ErrorCode::InvalidRequest
            | ErrorCode::GiftUsageLimitReached => 400,
            ErrorCode::DuplicateGiftCode => 409,
            ErrorCode::Internal => 500,
        }
    }

    /// Serializable body for the boundary layer.
    ///
    /// Internal failures get a generic message so store and cache details
    /// stay in the logs.
    #[must_use]
    pub fn body(&self) -> ErrorBody {
        let message = if self.is_client_fault() {
            self.to_string()
        } else {
            "could not perform action on gift".to_string()
        };
        ErrorBody {
            error_code: self.code(),
            message,
        }
    }
}

/// Wire shape of an error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error_code: ErrorCode,
    pub message: String,
}
