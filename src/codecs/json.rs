//! JSON Codec using `serde_json`

use crate::traits::CacheCodec;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON Codec using `serde_json`
///
/// Field-tagged and human-inspectable. This is the default codec for cached
/// gift entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl CacheCodec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).context("Failed to encode cache entry as JSON")
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).context("Failed to decode JSON cache entry")
    }

    fn name(&self) -> &'static str {
        "serde_json"
    }
}
