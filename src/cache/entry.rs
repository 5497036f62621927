//! Cache entries and their persisted layout.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Version written into every persisted cache document.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// A single cached value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub data: Value,
  /// Serialized size in bytes
  pub size: usize,
  #[serde(rename = "timestamp")]
  pub created_at: DateTime<Utc>,
  #[serde(rename = "type")]
  pub type_tag: String,
}

impl CacheEntry {
  pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
    now - self.created_at > ttl
  }
}

/// The whole cache table as stored under one key.
///
/// Entries are kept in eviction order, oldest first.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedCache {
  pub version: u32,
  pub entries: Vec<CacheEntry>,
}

/// Serialized byte size used for budget accounting.
pub fn measure(value: &Value) -> Result<usize, serde_json::Error> {
  serde_json::to_vec(value).map(|bytes| bytes.len())
}

/// Cache key for an endpoint URL: SHA-256 of the URL, hex encoded.
pub fn endpoint_key(endpoint: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(endpoint.as_bytes());
  hex::encode(hasher.finalize())
}
