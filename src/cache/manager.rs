//! Two-tier cache: an in-process table mirrored into the key-value store.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::entry::{measure, CacheEntry, PersistedCache, CACHE_FORMAT_VERSION};
use super::traits::{CacheStats, Cacheable, EvictionPolicy};
use crate::error::ApiError;
use crate::lock;
use crate::storage::KeyValueStore;

const COMPONENT: &str = "cache manager";

#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// Budget for the sum of all entry sizes.
  pub max_size_bytes: usize,
  /// Entries older than this are dropped on read.
  pub ttl: Duration,
  pub eviction: EvictionPolicy,
  /// Key the whole table is persisted under.
  pub storage_key: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_size_bytes: 5 * 1024 * 1024,
      ttl: Duration::from_secs(24 * 60 * 60),
      eviction: EvictionPolicy::InsertionOrder,
      storage_key: "api_cache".to_string(),
    }
  }
}

/// Size-bounded cache with TTL and write-through persistence.
///
/// Every mutating call rewrites the whole persisted table.
#[derive(Clone)]
pub struct CacheManager {
  inner: Arc<CacheInner>,
}

struct CacheInner {
  config: CacheConfig,
  store: Arc<dyn KeyValueStore>,
  state: Mutex<CacheState>,
  initialized: OnceCell<()>,
  disposed: AtomicBool,
}

#[derive(Default)]
struct CacheState {
  entries: HashMap<String, CacheEntry>,
  /// Eviction order, front is evicted first.
  order: VecDeque<String>,
  total_size: usize,
  stats: CacheStats,
}

impl CacheState {
  fn insert(&mut self, entry: CacheEntry) {
    self.total_size += entry.size;
    self.order.push_back(entry.key.clone());
    self.entries.insert(entry.key.clone(), entry);
  }

  fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    let entry = self.entries.remove(key)?;
    self.total_size -= entry.size;
    self.order.retain(|k| k != key);
    Some(entry)
  }

  fn touch(&mut self, key: &str) {
    if let Some(pos) = self.order.iter().position(|k| k == key) {
      if let Some(k) = self.order.remove(pos) {
        self.order.push_back(k);
      }
    }
  }

  /// Evict from the front until `incoming` more bytes fit in `max`.
  fn make_room(&mut self, incoming: usize, max: usize) {
    while self.total_size + incoming > max {
      let Some(victim) = self.order.front().cloned() else {
        break;
      };
      if let Some(entry) = self.remove(&victim) {
        self.stats.evictions += 1;
        debug!(key = %entry.key, size = entry.size, "evicted cache entry");
      }
    }
  }

  fn snapshot(&self) -> PersistedCache {
    PersistedCache {
      version: CACHE_FORMAT_VERSION,
      entries: self
        .order
        .iter()
        .filter_map(|key| self.entries.get(key).cloned())
        .collect(),
    }
  }
}

impl CacheManager {
  pub fn new(config: CacheConfig, store: Arc<dyn KeyValueStore>) -> Self {
    Self {
      inner: Arc::new(CacheInner {
        config,
        store,
        state: Mutex::new(CacheState::default()),
        initialized: OnceCell::new(),
        disposed: AtomicBool::new(false),
      }),
    }
  }

  /// Load the persisted table. Safe to call concurrently: exactly one load
  /// runs, other callers wait for it.
  pub async fn initialize(&self) -> Result<(), ApiError> {
    if self.inner.disposed.load(Ordering::SeqCst) {
      return Err(ApiError::Disposed(COMPONENT));
    }

    self
      .inner
      .initialized
      .get_or_try_init(|| async { self.load() })
      .await?;
    Ok(())
  }

  pub fn is_initialized(&self) -> bool {
    self.inner.initialized.initialized()
  }

  fn load(&self) -> Result<(), ApiError> {
    let config = &self.inner.config;
    let raw = self.inner.store.get_string(&config.storage_key)?;

    let persisted = match raw {
      Some(raw) => match serde_json::from_str::<PersistedCache>(&raw) {
        Ok(doc) if doc.version == CACHE_FORMAT_VERSION => doc.entries,
        Ok(doc) => {
          warn!(version = doc.version, "discarding cache written in unknown format");
          Vec::new()
        }
        Err(e) => {
          warn!(error = %e, "discarding unreadable persisted cache");
          Vec::new()
        }
      },
      None => Vec::new(),
    };

    let ttl = self.ttl();
    let now = Utc::now();
    let loaded = persisted.len();

    let mut state = lock(&self.inner.state);
    for entry in persisted {
      if entry.is_expired(ttl, now) {
        state.stats.expirations += 1;
        continue;
      }
      state.insert(entry);
    }
    state.make_room(0, config.max_size_bytes);

    if state.entries.len() != loaded {
      self.persist(&state)?;
    }

    info!(
      entries = state.entries.len(),
      bytes = state.total_size,
      "cache loaded"
    );
    Ok(())
  }

  fn ensure_live(&self) -> Result<(), ApiError> {
    if self.inner.disposed.load(Ordering::SeqCst) {
      return Err(ApiError::Disposed(COMPONENT));
    }
    if !self.is_initialized() {
      return Err(ApiError::NotInitialized(COMPONENT));
    }
    Ok(())
  }

  fn ttl(&self) -> chrono::Duration {
    chrono::Duration::from_std(self.inner.config.ttl)
      .unwrap_or_else(|_| chrono::Duration::days(365 * 100))
  }

  fn persist(&self, state: &CacheState) -> Result<(), ApiError> {
    let json = serde_json::to_string(&state.snapshot())?;
    self
      .inner
      .store
      .set_string(&self.inner.config.storage_key, &json)?;
    Ok(())
  }

  /// Read a live entry. Expired entries are removed and reported as absent.
  pub fn get<T: Cacheable>(&self, key: &str) -> Result<Option<T>, ApiError> {
    self.ensure_live()?;

    let mut state = lock(&self.inner.state);
    let Some(entry) = state.entries.get(key) else {
      state.stats.misses += 1;
      return Ok(None);
    };

    if entry.is_expired(self.ttl(), Utc::now()) {
      state.remove(key);
      state.stats.expirations += 1;
      state.stats.misses += 1;
      debug!(key, "cache entry expired");
      // The in-memory table is authoritative; a failed write is retried on the next mutation.
      if let Err(e) = self.persist(&state) {
        warn!(error = %e, "failed to persist cache after expiry");
      }
      return Ok(None);
    }

    if entry.type_tag != T::type_tag() {
      return Err(ApiError::CacheTypeMismatch {
        key: key.to_string(),
        expected: T::type_tag().to_string(),
        found: entry.type_tag.clone(),
      });
    }

    let value = serde_json::from_value(entry.data.clone())?;
    if self.inner.config.eviction == EvictionPolicy::LeastRecentlyUsed {
      state.touch(key);
    }
    state.stats.hits += 1;
    Ok(Some(value))
  }

  /// Store a value, evicting older entries until it fits.
  pub fn put<T: Cacheable>(&self, key: &str, value: &T) -> Result<(), ApiError> {
    self.ensure_live()?;

    let data = serde_json::to_value(value)?;
    let size = measure(&data)?;
    let max = self.inner.config.max_size_bytes;
    if size > max {
      return Err(ApiError::CacheEntryTooLarge {
        key: key.to_string(),
        size,
        max,
      });
    }

    let mut state = lock(&self.inner.state);
    state.remove(key);
    state.make_room(size, max);
    state.insert(CacheEntry {
      key: key.to_string(),
      data,
      size,
      created_at: Utc::now(),
      type_tag: T::type_tag().to_string(),
    });
    debug!(key, size, total = state.total_size, "cached value");

    self.persist(&state)
  }

  /// Returns `true` if the key was present.
  pub fn remove(&self, key: &str) -> Result<bool, ApiError> {
    self.ensure_live()?;

    let mut state = lock(&self.inner.state);
    if state.remove(key).is_none() {
      return Ok(false);
    }
    self.persist(&state)?;
    Ok(true)
  }

  pub fn clear(&self) -> Result<(), ApiError> {
    self.ensure_live()?;

    let mut state = lock(&self.inner.state);
    state.entries.clear();
    state.order.clear();
    state.total_size = 0;
    self.persist(&state)?;
    info!("cache cleared");
    Ok(())
  }

  /// Whether a live (non-expired) entry exists. Does not count as a hit.
  pub fn contains(&self, key: &str) -> Result<bool, ApiError> {
    self.ensure_live()?;

    let state = lock(&self.inner.state);
    Ok(
      state
        .entries
        .get(key)
        .is_some_and(|entry| !entry.is_expired(self.ttl(), Utc::now())),
    )
  }

  /// Keys in eviction order.
  pub fn keys(&self) -> Vec<String> {
    lock(&self.inner.state).order.iter().cloned().collect()
  }

  pub fn stats(&self) -> CacheStats {
    let state = lock(&self.inner.state);
    CacheStats {
      entries: state.entries.len(),
      total_size: state.total_size,
      ..state.stats
    }
  }

  pub fn max_size(&self) -> usize {
    self.inner.config.max_size_bytes
  }

  /// Release the in-memory table. Persisted data is left intact.
  pub fn dispose(&self) {
    self.inner.disposed.store(true, Ordering::SeqCst);
    let mut state = lock(&self.inner.state);
    *state = CacheState::default();
    debug!("cache manager disposed");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::MemoryStore;
  use serde_json::{json, Value};
  use std::sync::atomic::AtomicUsize;

  fn manager_with(config: CacheConfig, store: Arc<dyn KeyValueStore>) -> CacheManager {
    CacheManager::new(config, store)
  }

  async fn ready(config: CacheConfig) -> (CacheManager, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let cache = manager_with(config, store.clone());
    cache.initialize().await.unwrap();
    (cache, store)
  }

  #[tokio::test]
  async fn test_put_then_get() {
    let (cache, _) = ready(CacheConfig::default()).await;
    cache.put("pokemon/25", &json!({"name": "pikachu"})).unwrap();

    let value: Option<Value> = cache.get("pokemon/25").unwrap();
    assert_eq!(value, Some(json!({"name": "pikachu"})));
    assert_eq!(cache.get::<Value>("pokemon/1").unwrap(), None);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 1);
  }

  #[tokio::test]
  async fn test_requires_initialize() {
    let cache = manager_with(CacheConfig::default(), Arc::new(MemoryStore::new()));
    assert_eq!(
      cache.get::<Value>("k"),
      Err(ApiError::NotInitialized("cache manager"))
    );
  }

  #[tokio::test]
  async fn test_type_mismatch() {
    let (cache, _) = ready(CacheConfig::default()).await;
    cache.put("name", &"bulbasaur".to_string()).unwrap();

    let result = cache.get::<Value>("name");
    assert!(matches!(result, Err(ApiError::CacheTypeMismatch { .. })));
    assert_eq!(cache.get::<String>("name").unwrap().as_deref(), Some("bulbasaur"));
  }

  #[tokio::test]
  async fn test_expired_entry_is_removed() {
    let config = CacheConfig {
      ttl: Duration::from_millis(20),
      ..CacheConfig::default()
    };
    let (cache, store) = ready(config.clone()).await;
    cache.put("k", &json!(1)).unwrap();

    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get::<Value>("k").unwrap(), None);
    assert!(cache.keys().is_empty());

    // Still gone after a reload from storage.
    let reloaded = manager_with(config, store);
    reloaded.initialize().await.unwrap();
    assert_eq!(reloaded.get::<Value>("k").unwrap(), None);
  }

  #[tokio::test]
  async fn test_expired_entries_purged_on_load() {
    let store = Arc::new(MemoryStore::new());
    let old = CacheEntry {
      key: "old".into(),
      data: json!(1),
      size: 1,
      created_at: Utc::now() - chrono::Duration::hours(48),
      type_tag: "json".into(),
    };
    let fresh = CacheEntry {
      key: "fresh".into(),
      created_at: Utc::now(),
      ..old.clone()
    };
    let doc = PersistedCache {
      version: CACHE_FORMAT_VERSION,
      entries: vec![old, fresh],
    };
    store
      .set_string("api_cache", &serde_json::to_string(&doc).unwrap())
      .unwrap();

    let cache = manager_with(CacheConfig::default(), store.clone());
    cache.initialize().await.unwrap();

    assert_eq!(cache.keys(), vec!["fresh".to_string()]);
    let persisted: PersistedCache =
      serde_json::from_str(&store.get_string("api_cache").unwrap().unwrap()).unwrap();
    assert_eq!(persisted.entries.len(), 1);
  }

  #[tokio::test]
  async fn test_size_bound_evicts_oldest_first() {
    let config = CacheConfig {
      max_size_bytes: 100,
      ..CacheConfig::default()
    };
    let (cache, _) = ready(config).await;
    let payload = json!("x".repeat(28)); // 30 bytes serialized

    for key in ["a", "b", "c", "d", "e"] {
      cache.put(key, &payload).unwrap();
      assert!(cache.stats().total_size <= 100);
    }

    assert_eq!(cache.keys(), vec!["c", "d", "e"]);
    assert_eq!(cache.stats().evictions, 2);
  }

  #[tokio::test]
  async fn test_insertion_order_ignores_reads() {
    let config = CacheConfig {
      max_size_bytes: 60,
      ..CacheConfig::default()
    };
    let (cache, _) = ready(config).await;
    let payload = json!("x".repeat(28));

    cache.put("a", &payload).unwrap();
    cache.put("b", &payload).unwrap();
    let _ = cache.get::<Value>("a").unwrap();
    cache.put("c", &payload).unwrap();

    assert_eq!(cache.keys(), vec!["b", "c"]);
  }

  #[tokio::test]
  async fn test_lru_policy_keeps_recently_read() {
    let config = CacheConfig {
      max_size_bytes: 60,
      eviction: EvictionPolicy::LeastRecentlyUsed,
      ..CacheConfig::default()
    };
    let (cache, _) = ready(config).await;
    let payload = json!("x".repeat(28));

    cache.put("a", &payload).unwrap();
    cache.put("b", &payload).unwrap();
    let _ = cache.get::<Value>("a").unwrap();
    cache.put("c", &payload).unwrap();

    assert_eq!(cache.keys(), vec!["a", "c"]);
  }

  #[tokio::test]
  async fn test_entry_too_large() {
    let config = CacheConfig {
      max_size_bytes: 10,
      ..CacheConfig::default()
    };
    let (cache, _) = ready(config).await;

    let result = cache.put("big", &json!("this is far too long"));
    assert!(matches!(result, Err(ApiError::CacheEntryTooLarge { .. })));
    assert_eq!(cache.stats().entries, 0);
  }

  #[tokio::test]
  async fn test_overwrite_updates_size() {
    let (cache, _) = ready(CacheConfig::default()).await;
    cache.put("k", &json!("aaaa")).unwrap();
    cache.put("k", &json!("a")).unwrap();

    assert_eq!(cache.stats().entries, 1);
    assert_eq!(cache.stats().total_size, 3);
  }

  #[tokio::test]
  async fn test_survives_reload() {
    let (cache, store) = ready(CacheConfig::default()).await;
    cache.put("a", &json!({"id": 1})).unwrap();
    cache.put("b", &json!({"id": 2})).unwrap();
    assert!(cache.remove("a").unwrap());

    let reloaded = manager_with(CacheConfig::default(), store);
    reloaded.initialize().await.unwrap();
    assert_eq!(reloaded.keys(), vec!["b"]);
    assert_eq!(reloaded.get::<Value>("b").unwrap(), Some(json!({"id": 2})));
  }

  #[tokio::test]
  async fn test_unknown_format_version_is_discarded() {
    let store = Arc::new(MemoryStore::new());
    store
      .set_string("api_cache", r#"{"version": 99, "entries": []}"#)
      .unwrap();
    store.set_string("other", "untouched").unwrap();

    let cache = manager_with(CacheConfig::default(), store.clone());
    cache.initialize().await.unwrap();
    assert!(cache.keys().is_empty());
    assert_eq!(store.get_string("other").unwrap().as_deref(), Some("untouched"));
  }

  #[tokio::test]
  async fn test_clear_and_dispose() {
    let (cache, store) = ready(CacheConfig::default()).await;
    cache.put("a", &json!(1)).unwrap();
    cache.clear().unwrap();
    assert_eq!(cache.stats().total_size, 0);

    let persisted: PersistedCache =
      serde_json::from_str(&store.get_string("api_cache").unwrap().unwrap()).unwrap();
    assert!(persisted.entries.is_empty());

    cache.dispose();
    assert_eq!(cache.get::<Value>("a"), Err(ApiError::Disposed("cache manager")));
    assert_eq!(cache.initialize().await, Err(ApiError::Disposed("cache manager")));
  }

  /// Counts how often the persisted table is read.
  struct CountingStore {
    inner: MemoryStore,
    reads: AtomicUsize,
  }

  impl KeyValueStore for CountingStore {
    fn get_string(&self, key: &str) -> color_eyre::Result<Option<String>> {
      self.reads.fetch_add(1, Ordering::SeqCst);
      self.inner.get_string(key)
    }
    fn set_string(&self, key: &str, value: &str) -> color_eyre::Result<()> {
      self.inner.set_string(key, value)
    }
    fn get_int(&self, key: &str) -> color_eyre::Result<Option<i64>> {
      self.inner.get_int(key)
    }
    fn set_int(&self, key: &str, value: i64) -> color_eyre::Result<()> {
      self.inner.set_int(key, value)
    }
    fn remove(&self, key: &str) -> color_eyre::Result<bool> {
      self.inner.remove(key)
    }
    fn keys(&self) -> color_eyre::Result<std::collections::BTreeSet<String>> {
      self.inner.keys()
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_initialize_loads_once() {
    let store = Arc::new(CountingStore {
      inner: MemoryStore::new(),
      reads: AtomicUsize::new(0),
    });
    let cache = manager_with(CacheConfig::default(), store.clone());

    let mut handles = Vec::new();
    for _ in 0..8 {
      let cache = cache.clone();
      handles.push(tokio::spawn(async move { cache.initialize().await }));
    }
    for handle in handles {
      handle.await.unwrap().unwrap();
    }

    assert_eq!(store.reads.load(Ordering::SeqCst), 1);
  }
}
