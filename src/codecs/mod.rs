//! Cache Codec Implementations
//!
//! Built-in implementations of the [`CacheCodec`](crate::traits::CacheCodec) trait.
//! Cached gifts are stored as JSON so an operator can read a key straight out
//! of `redis-cli` while debugging.

mod json;
pub use json::JsonCodec;
