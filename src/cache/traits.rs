//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Trait for values that can be stored in the cache.
///
/// The type tag is persisted next to each entry so a read with the wrong type
/// is reported instead of silently misinterpreting the data.
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync {
  /// Stable name for the stored type (e.g., "json", "pokemon")
  fn type_tag() -> &'static str;
}

impl Cacheable for Value {
  fn type_tag() -> &'static str {
    "json"
  }
}

impl Cacheable for String {
  fn type_tag() -> &'static str {
    "string"
  }
}

/// Which entry gets evicted first under size pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
  /// Oldest-inserted entry first. Reads do not change the order.
  #[default]
  InsertionOrder,
  /// Least recently read or written entry first.
  LeastRecentlyUsed,
}

/// Counters describing the cache contents and its effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub total_size: usize,
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub expirations: u64,
}
