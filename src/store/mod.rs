//! Durable Store Implementations
//!
//! # Available Stores
//!
//! - **Postgres** - The canonical `gift` table via `sqlx` (feature: `postgres`)
//! - **Memory** - Process-local table with the same constraints, used by
//!   tests and the demo
//!
//! Both enforce uniqueness of `code` and report violations as
//! [`StoreError::DuplicateCode`](crate::error::StoreError::DuplicateCode).

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryGiftStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresGiftStore;
