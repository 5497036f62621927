//! Durable string-keyed storage used by the cache, the sync outbox and the
//! connectivity manager.
//!
//! Callers serialize structured data to JSON themselves; the store only knows
//! strings and integers.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use color_eyre::Result;
use std::collections::BTreeSet;

/// Trait for persistent key-value back-ends.
pub trait KeyValueStore: Send + Sync {
  fn get_string(&self, key: &str) -> Result<Option<String>>;

  fn set_string(&self, key: &str, value: &str) -> Result<()>;

  fn get_int(&self, key: &str) -> Result<Option<i64>>;

  fn set_int(&self, key: &str, value: i64) -> Result<()>;

  /// Returns `true` if the key existed.
  fn remove(&self, key: &str) -> Result<bool>;

  fn keys(&self) -> Result<BTreeSet<String>>;
}
