//! Two-tier caching for API responses and offline support.
//!
//! This module provides a size-bounded cache that:
//! - Keeps a typed in-memory table of JSON values
//! - Mirrors the whole table into a `KeyValueStore` on every mutation
//! - Expires entries on read once they outlive the TTL
//! - Evicts by insertion order (or LRU, when configured) under size pressure

mod entry;
mod manager;
mod traits;

pub use entry::{endpoint_key, CacheEntry, PersistedCache, CACHE_FORMAT_VERSION};
pub use manager::{CacheConfig, CacheManager};
pub use traits::{CacheStats, Cacheable, EvictionPolicy};
