//! Durable outbox of operations deferred while offline.
//!
//! Entries are persisted as one versioned JSON document on every change and
//! replayed in batches once the network is back. Each operation kind is
//! applied by a registered [`SyncHandler`]; the `"fetch"` kind re-requests an
//! endpoint and refreshes its cache entry.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::cache::{endpoint_key, CacheManager};
use crate::connectivity::ConnectivityManager;
use crate::error::ApiError;
use crate::lock;
use crate::queue::Priority;
use crate::request::{RequestManager, RequestOptions};
use crate::storage::KeyValueStore;
use crate::transport::Transport;

const COMPONENT: &str = "sync manager";

/// Version written into every persisted outbox document.
pub const SYNC_FORMAT_VERSION: u32 = 1;

/// Operation kind replayed by [`fetch_handler`].
pub const FETCH_OPERATION: &str = "fetch";

/// One deferred operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
  pub id: String,
  pub operation: String,
  pub endpoint: String,
  #[serde(default)]
  pub payload: Option<Value>,
  #[serde(rename = "timestamp")]
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub retry_count: u32,
  #[serde(default)]
  pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedOutbox {
  version: u32,
  entries: Vec<SyncEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
  Idle,
  Syncing,
  Completed,
  WaitingForConnection,
  Error,
}

/// Counts from a single `sync` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub succeeded: usize,
  pub failed: usize,
  /// Entries discarded after exhausting their retries.
  pub dropped: usize,
}

impl SyncReport {
  pub fn processed(&self) -> usize {
    self.succeeded + self.failed
  }
}

/// Applies one entry remotely.
pub type SyncHandler = Arc<dyn Fn(SyncEntry) -> BoxFuture<'static, Result<(), ApiError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SyncConfig {
  pub batch_size: usize,
  /// Failed attempts tolerated per entry before it is dropped.
  pub max_retries: u32,
  /// Safety-net period for automatic syncs.
  pub sync_interval: Duration,
  /// Entries older than this are purged on load.
  pub max_entry_age: Duration,
  /// Delay before the next automatic attempt after failed batches.
  pub backoff: BackoffPolicy,
  /// Fully failed batches in a row before the status turns `Error`.
  pub max_consecutive_failures: u32,
  pub storage_key: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      batch_size: 10,
      max_retries: 3,
      sync_interval: Duration::from_secs(15 * 60),
      max_entry_age: Duration::from_secs(7 * 24 * 60 * 60),
      backoff: BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(5 * 60)),
      max_consecutive_failures: 3,
      storage_key: "sync_queue".to_string(),
    }
  }
}

/// Outbox handle. Cheap to clone.
#[derive(Clone)]
pub struct SyncManager {
  inner: Arc<SyncInner>,
}

struct SyncInner {
  config: SyncConfig,
  store: Arc<dyn KeyValueStore>,
  connectivity: ConnectivityManager,
  handlers: Mutex<HashMap<String, SyncHandler>>,
  entries: Mutex<Vec<SyncEntry>>,
  syncing: AtomicBool,
  consecutive_failures: AtomicU32,
  status: watch::Sender<SyncStatus>,
  progress: watch::Sender<f64>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
  retry: Mutex<Option<JoinHandle<()>>>,
  initialized: OnceCell<()>,
  disposed: AtomicBool,
}

/// Clears the re-entrancy flag when a sync pass ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl SyncManager {
  pub fn new(
    config: SyncConfig,
    store: Arc<dyn KeyValueStore>,
    connectivity: ConnectivityManager,
  ) -> Self {
    let (status, _) = watch::channel(SyncStatus::Idle);
    let (progress, _) = watch::channel(0.0);
    Self {
      inner: Arc::new(SyncInner {
        config,
        store,
        connectivity,
        handlers: Mutex::new(HashMap::new()),
        entries: Mutex::new(Vec::new()),
        syncing: AtomicBool::new(false),
        consecutive_failures: AtomicU32::new(0),
        status,
        progress,
        tasks: Mutex::new(Vec::new()),
        retry: Mutex::new(None),
        initialized: OnceCell::new(),
        disposed: AtomicBool::new(false),
      }),
    }
  }

  /// Load the persisted outbox once. Concurrent callers share the load.
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

  fn load(&self) -> Result<(), ApiError> {
    let config = &self.inner.config;
    let raw = self.inner.store.get_string(&config.storage_key)?;

    let persisted = match raw {
      Some(raw) => match serde_json::from_str::<PersistedOutbox>(&raw) {
        Ok(doc) if doc.version == SYNC_FORMAT_VERSION => doc.entries,
        Ok(doc) => {
          warn!(version = doc.version, "discarding sync queue written in unknown format");
          Vec::new()
        }
        Err(e) => {
          warn!(error = %e, "discarding unreadable sync queue");
          Vec::new()
        }
      },
      None => Vec::new(),
    };

    let max_age = chrono::Duration::from_std(config.max_entry_age)
      .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
    let cutoff = Utc::now() - max_age;
    let loaded = persisted.len();
    let fresh: Vec<SyncEntry> = persisted
      .into_iter()
      .filter(|entry| entry.created_at >= cutoff)
      .collect();

    if fresh.len() != loaded {
      info!(purged = loaded - fresh.len(), "purged stale sync entries");
      self.persist(&fresh)?;
    }

    info!(entries = fresh.len(), "sync queue loaded");
    *lock(&self.inner.entries) = fresh;
    Ok(())
  }

  fn ensure_live(&self) -> Result<(), ApiError> {
    if self.inner.disposed.load(Ordering::SeqCst) {
      return Err(ApiError::Disposed(COMPONENT));
    }
    if !self.inner.initialized.initialized() {
      return Err(ApiError::NotInitialized(COMPONENT));
    }
    Ok(())
  }

  fn persist(&self, entries: &[SyncEntry]) -> Result<(), ApiError> {
    let json = serde_json::to_string(&PersistedOutbox {
      version: SYNC_FORMAT_VERSION,
      entries: entries.to_vec(),
    })?;
    self
      .inner
      .store
      .set_string(&self.inner.config.storage_key, &json)?;
    Ok(())
  }

  /// Register the remote-apply step for an operation kind, replacing any previous one.
  pub fn register_handler(&self, operation: impl Into<String>, handler: SyncHandler) {
    lock(&self.inner.handlers).insert(operation.into(), handler);
  }

  /// Queue a deferred fetch of `endpoint`. A fetch already queued for the
  /// same endpoint is reused.
  pub fn queue_offline_operation(&self, endpoint: &str) -> Result<String, ApiError> {
    self.ensure_live()?;

    let existing = lock(&self.inner.entries)
      .iter()
      .find(|entry| entry.operation == FETCH_OPERATION && entry.endpoint == endpoint)
      .map(|entry| entry.id.clone());
    if let Some(id) = existing {
      debug!(endpoint, "fetch already queued");
      return Ok(id);
    }

    self.add_to_sync_queue(FETCH_OPERATION, endpoint, None)
  }

  /// Append an operation, persist the outbox and sync right away when online.
  pub fn add_to_sync_queue(
    &self,
    operation: &str,
    endpoint: &str,
    payload: Option<Value>,
  ) -> Result<String, ApiError> {
    self.ensure_live()?;

    let entry = SyncEntry {
      id: Uuid::new_v4().to_string(),
      operation: operation.to_string(),
      endpoint: endpoint.to_string(),
      payload,
      created_at: Utc::now(),
      retry_count: 0,
      last_error: None,
    };
    let id = entry.id.clone();

    {
      let mut entries = lock(&self.inner.entries);
      entries.push(entry);
      self.persist(&entries)?;
    }
    debug!(id = %id, operation, endpoint, "queued sync entry");

    if self.inner.connectivity.is_online() {
      self.trigger();
    }
    Ok(id)
  }

  pub fn pending_count(&self) -> usize {
    lock(&self.inner.entries).len()
  }

  pub fn entries(&self) -> Vec<SyncEntry> {
    lock(&self.inner.entries).clone()
  }

  /// Drop every queued entry. Returns how many were removed.
  pub fn clear(&self) -> Result<usize, ApiError> {
    self.ensure_live()?;

    let mut entries = lock(&self.inner.entries);
    let removed = entries.len();
    entries.clear();
    self.persist(&entries)?;
    Ok(removed)
  }

  pub fn status(&self) -> SyncStatus {
    *self.inner.status.borrow()
  }

  pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
    self.inner.status.subscribe()
  }

  /// Fraction of the current pass completed, in `[0.0, 1.0]`.
  pub fn progress(&self) -> f64 {
    *self.inner.progress.borrow()
  }

  pub fn watch_progress(&self) -> watch::Receiver<f64> {
    self.inner.progress.subscribe()
  }

  fn set_status(&self, status: SyncStatus) {
    let previous = self.inner.status.send_replace(status);
    if previous != status {
      debug!(from = ?previous, to = ?status, "sync status changed");
    }
  }

  /// Replay queued entries. Does nothing when a pass is already running,
  /// the outbox is empty, or the network is down.
  pub async fn sync(&self) -> Result<SyncReport, ApiError> {
    self.ensure_live()?;

    if self.inner.syncing.swap(true, Ordering::SeqCst) {
      debug!("sync already in progress");
      return Ok(SyncReport::default());
    }
    let _guard = SyncingGuard(&self.inner.syncing);

    let snapshot = self.entries();
    if snapshot.is_empty() {
      return Ok(SyncReport::default());
    }
    if !self.inner.connectivity.is_online() {
      self.wait_for_connection();
      return Ok(SyncReport::default());
    }

    self.set_status(SyncStatus::Syncing);
    self.inner.progress.send_replace(0.0);
    info!(entries = snapshot.len(), "sync started");

    let total = snapshot.len();
    let batch_size = self.inner.config.batch_size.max(1);
    let mut report = SyncReport::default();

    for batch in snapshot.chunks(batch_size) {
      if !self.inner.connectivity.is_online() {
        self.wait_for_connection();
        return Ok(report);
      }

      let results = join_all(batch.iter().cloned().map(|entry| self.apply(entry))).await;

      let mut batch_failures = 0;
      {
        let mut entries = lock(&self.inner.entries);
        for (entry, result) in batch.iter().zip(results) {
          match result {
            Ok(()) => {
              entries.retain(|e| e.id != entry.id);
              report.succeeded += 1;
            }
            Err(e) => {
              batch_failures += 1;
              report.failed += 1;
              if self.record_failure(&mut entries, &entry.id, &e) {
                report.dropped += 1;
              }
            }
          }
        }
        if let Err(e) = self.persist(&entries) {
          error!(error = %e, "failed to persist sync queue");
        }
      }

      if batch_failures == batch.len() {
        self.inner.consecutive_failures.fetch_add(1, Ordering::SeqCst);
      } else {
        self.inner.consecutive_failures.store(0, Ordering::SeqCst);
      }

      let progress = report.processed() as f64 / total as f64;
      self.inner.progress.send_replace(progress.clamp(0.0, 1.0));
    }

    let failures = self.inner.consecutive_failures.load(Ordering::SeqCst);
    if failures >= self.inner.config.max_consecutive_failures {
      warn!(failures, "sync keeps failing");
      self.set_status(SyncStatus::Error);
      self.schedule_retry(self.inner.config.backoff.delay(failures));
    } else {
      self.set_status(SyncStatus::Completed);
      if self.pending_count() > 0 {
        self.schedule_retry(self.inner.config.backoff.delay(failures));
      }
    }

    info!(
      succeeded = report.succeeded,
      failed = report.failed,
      dropped = report.dropped,
      "sync finished"
    );
    Ok(report)
  }

  async fn apply(&self, entry: SyncEntry) -> Result<(), ApiError> {
    let handler = lock(&self.inner.handlers).get(&entry.operation).cloned();
    match handler {
      Some(handler) => handler(entry).await,
      None => Err(ApiError::Unexpected(format!(
        "no sync handler for operation '{}'",
        entry.operation
      ))),
    }
  }

  /// Bump the entry's retry count. Returns `true` if it was dropped.
  fn record_failure(&self, entries: &mut Vec<SyncEntry>, id: &str, e: &ApiError) -> bool {
    let Some(pos) = entries.iter().position(|entry| entry.id == id) else {
      return false;
    };

    let entry = &mut entries[pos];
    entry.retry_count += 1;
    entry.last_error = Some(e.to_string());

    if entry.retry_count > self.inner.config.max_retries {
      warn!(
        id = %entry.id,
        endpoint = %entry.endpoint,
        attempts = entry.retry_count,
        error = %e,
        "dropping sync entry after repeated failures"
      );
      entries.remove(pos);
      true
    } else {
      debug!(id = %entry.id, retry = entry.retry_count, error = %e, "sync entry failed");
      false
    }
  }

  fn wait_for_connection(&self) {
    self.set_status(SyncStatus::WaitingForConnection);
    let failures = self.inner.consecutive_failures.load(Ordering::SeqCst);
    self.schedule_retry(self.inner.config.backoff.delay(failures));
  }

  /// Run `sync` in the background now.
  fn trigger(&self) {
    let manager = self.clone();
    tokio::spawn(async move { manager.run_logged().await });
  }

  /// Run `sync` once after `delay`, replacing any earlier scheduled retry.
  /// Only armed while the automatic triggers from [`SyncManager::start`] run.
  fn schedule_retry(&self, delay: Duration) {
    if self.inner.disposed.load(Ordering::SeqCst) {
      return;
    }
    if lock(&self.inner.tasks).is_empty() {
      debug!("sync triggers not running, no retry scheduled");
      return;
    }

    let manager = self.clone();
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      manager.run_logged().await;
    });
    debug!(?delay, "scheduled sync retry");

    if let Some(previous) = lock(&self.inner.retry).replace(handle) {
      previous.abort();
    }
  }

  async fn run_logged(&self) {
    if let Err(e) = self.sync().await {
      warn!(error = %e, "background sync failed");
    }
  }

  /// Sync on every offline to online transition and every `sync_interval`.
  pub fn start(&self) {
    if self.inner.disposed.load(Ordering::SeqCst) {
      return;
    }

    let mut tasks = lock(&self.inner.tasks);
    if !tasks.is_empty() {
      return;
    }

    let manager = self.clone();
    let mut transitions = self.inner.connectivity.subscribe();
    tasks.push(tokio::spawn(async move {
      let mut was_online = manager.inner.connectivity.is_online();
      loop {
        match transitions.recv().await {
          Ok(state) => {
            if !was_online && state.is_online() {
              info!(state = %state, "connection restored, syncing");
              manager.run_logged().await;
            }
            was_online = state.is_online();
          }
          Err(broadcast::error::RecvError::Lagged(_)) => {
            was_online = manager.inner.connectivity.is_online();
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    }));

    let manager = self.clone();
    let period = self.inner.config.sync_interval;
    tasks.push(tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      loop {
        ticker.tick().await;
        manager.run_logged().await;
      }
    }));
    drop(tasks);

    if self.inner.connectivity.is_online() && self.pending_count() > 0 {
      self.trigger();
    }
    info!("sync manager started");
  }

  pub fn stop(&self) {
    for handle in lock(&self.inner.tasks).drain(..) {
      handle.abort();
    }
    if let Some(handle) = lock(&self.inner.retry).take() {
      handle.abort();
    }
  }

  pub fn dispose(&self) {
    self.inner.disposed.store(true, Ordering::SeqCst);
    self.stop();
    debug!("sync manager disposed");
  }
}

/// Handler for [`FETCH_OPERATION`]: re-request the endpoint through the
/// request scheduler and store the JSON body in the cache.
pub fn fetch_handler(
  requests: RequestManager,
  transport: Arc<dyn Transport>,
  cache: CacheManager,
  timeout: Duration,
) -> SyncHandler {
  Arc::new(move |entry: SyncEntry| {
    let requests = requests.clone();
    let transport = Arc::clone(&transport);
    let cache = cache.clone();

    async move {
      let url = entry.endpoint.clone();
      let value: Value = requests
        .execute_request(
          format!("sync:{}", url),
          move || {
            let transport = Arc::clone(&transport);
            let url = url.clone();
            async move {
              let response = transport.send_get(&url, &[], timeout).await?;
              if !response.is_ok() {
                return Err(ApiError::from_status(response.status));
              }
              Ok(serde_json::from_str::<Value>(&response.body)?)
            }
          },
          RequestOptions {
            priority: Priority::Low,
            timeout: Some(timeout),
            max_retries: Some(0),
            token: None,
          },
        )
        .await?;

      cache.put(&endpoint_key(&entry.endpoint), &value)
    }
    .boxed()
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheConfig;
  use crate::connectivity::{ConnectivityConfig, LinkState, ManualLinkMonitor};
  use crate::request::RequestConfig;
  use crate::storage::MemoryStore;
  use crate::test_support::MockTransport;
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::Notify;

  struct Fixture {
    sync: SyncManager,
    connectivity: ConnectivityManager,
    link: Arc<ManualLinkMonitor>,
    transport: Arc<MockTransport>,
    store: Arc<MemoryStore>,
  }

  async fn fixture(link: LinkState) -> Fixture {
    let transport = MockTransport::new();
    transport.respond_always(200, "{}");
    let link = Arc::new(ManualLinkMonitor::new(link));
    let store = Arc::new(MemoryStore::new());
    let connectivity = ConnectivityManager::new(
      ConnectivityConfig::default(),
      transport.clone(),
      link.clone(),
      store.clone(),
    );
    connectivity.check_connectivity().await.unwrap();

    let sync = SyncManager::new(SyncConfig::default(), store.clone(), connectivity.clone());
    sync.initialize().await.unwrap();
    Fixture {
      sync,
      connectivity,
      link,
      transport,
      store,
    }
  }

  fn counting_handler(count: Arc<AtomicUsize>, result: Result<(), ApiError>) -> SyncHandler {
    Arc::new(move |_entry| {
      let count = count.clone();
      let result = result.clone();
      async move {
        count.fetch_add(1, Ordering::SeqCst);
        result
      }
      .boxed()
    })
  }

  #[tokio::test(start_paused = true)]
  async fn test_outbox_survives_reload() {
    let f = fixture(LinkState::None).await;
    f.sync
      .add_to_sync_queue("fetch", "https://api.example.com/pokemon/25", None)
      .unwrap();
    f.sync
      .add_to_sync_queue("favorite", "https://api.example.com/pokemon/1", Some(serde_json::json!({"on": true})))
      .unwrap();
    let before = f.sync.entries();

    let reloaded = SyncManager::new(SyncConfig::default(), f.store.clone(), f.connectivity.clone());
    reloaded.initialize().await.unwrap();

    assert_eq!(reloaded.entries(), before);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entries_purged_on_load() {
    let store = Arc::new(MemoryStore::new());
    let fresh = SyncEntry {
      id: "fresh".into(),
      operation: "fetch".into(),
      endpoint: "https://api.example.com/pokemon/1".into(),
      payload: None,
      created_at: Utc::now() - chrono::Duration::days(1),
      retry_count: 0,
      last_error: None,
    };
    let stale = SyncEntry {
      id: "stale".into(),
      created_at: Utc::now() - chrono::Duration::days(8),
      ..fresh.clone()
    };
    let doc = serde_json::json!({"version": 1, "entries": [fresh, stale]});
    store.set_string("sync_queue", &doc.to_string()).unwrap();

    let f = fixture(LinkState::None).await;
    let sync = SyncManager::new(SyncConfig::default(), store.clone(), f.connectivity.clone());
    sync.initialize().await.unwrap();

    let ids: Vec<String> = sync.entries().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["fresh".to_string()]);
    assert!(!store.get_string("sync_queue").unwrap().unwrap().contains("stale"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_unknown_version_discarded() {
    let store = Arc::new(MemoryStore::new());
    store
      .set_string("sync_queue", r#"{"version": 7, "entries": []}"#)
      .unwrap();
    let f = fixture(LinkState::None).await;

    let sync = SyncManager::new(SyncConfig::default(), store, f.connectivity.clone());
    sync.initialize().await.unwrap();
    assert_eq!(sync.pending_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_requires_initialize() {
    let f = fixture(LinkState::None).await;
    let sync = SyncManager::new(SyncConfig::default(), f.store.clone(), f.connectivity.clone());

    assert_eq!(
      sync.queue_offline_operation("https://api.example.com/pokemon/1"),
      Err(ApiError::NotInitialized("sync manager"))
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_fetch_deduplicated() {
    let f = fixture(LinkState::None).await;
    let first = f.sync.queue_offline_operation("https://api.example.com/pokemon/25").unwrap();
    let second = f.sync.queue_offline_operation("https://api.example.com/pokemon/25").unwrap();

    assert_eq!(first, second);
    assert_eq!(f.sync.pending_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sync_offline_waits() {
    let f = fixture(LinkState::None).await;
    let count = Arc::new(AtomicUsize::new(0));
    f.sync.register_handler("fetch", counting_handler(count.clone(), Ok(())));
    f.sync.queue_offline_operation("https://api.example.com/pokemon/25").unwrap();

    let report = f.sync.sync().await.unwrap();

    assert_eq!(report, SyncReport::default());
    assert_eq!(f.sync.status(), SyncStatus::WaitingForConnection);
    assert_eq!(f.sync.pending_count(), 1);
    assert_eq!(count.load(Ordering::SeqCst), 0);
    f.sync.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_sync_applies_in_batches() {
    let f = fixture(LinkState::None).await;
    let count = Arc::new(AtomicUsize::new(0));
    f.sync.register_handler("fetch", counting_handler(count.clone(), Ok(())));
    for i in 0..25 {
      f.sync
        .queue_offline_operation(&format!("https://api.example.com/pokemon/{}", i))
        .unwrap();
    }

    f.link.set(LinkState::Wifi);
    f.connectivity.check_connectivity().await.unwrap();
    let mut progress = f.sync.watch_progress();
    let report = f.sync.sync().await.unwrap();

    assert_eq!(report.succeeded, 25);
    assert_eq!(count.load(Ordering::SeqCst), 25);
    assert_eq!(f.sync.pending_count(), 0);
    assert_eq!(f.sync.status(), SyncStatus::Completed);
    assert!(progress.has_changed().unwrap());
    assert_eq!(*progress.borrow_and_update(), 1.0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failing_entry_dropped_after_retries() {
    let f = fixture(LinkState::Wifi).await;
    let count = Arc::new(AtomicUsize::new(0));
    f.sync.register_handler(
      "favorite",
      counting_handler(count.clone(), Err(ApiError::from_status(500))),
    );
    f.sync.stop();
    f.link.set(LinkState::None);
    f.connectivity.check_connectivity().await.unwrap();
    f.sync
      .add_to_sync_queue("favorite", "https://api.example.com/pokemon/7", None)
      .unwrap();
    f.link.set(LinkState::Wifi);
    f.connectivity.check_connectivity().await.unwrap();

    for attempt in 1..=3 {
      let report = f.sync.sync().await.unwrap();
      assert_eq!(report.failed, 1);
      assert_eq!(report.dropped, 0);
      let entry = &f.sync.entries()[0];
      assert_eq!(entry.retry_count, attempt);
      assert!(entry.last_error.as_deref().unwrap().contains("500"));
    }

    let report = f.sync.sync().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(f.sync.pending_count(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 4);
    f.sync.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_repeated_failures_reach_error_before_drop() {
    let f = fixture(LinkState::None).await;
    let count = Arc::new(AtomicUsize::new(0));
    f.sync.register_handler(
      "favorite",
      counting_handler(count.clone(), Err(ApiError::Timeout("slow".into()))),
    );
    f.sync
      .add_to_sync_queue("favorite", "https://api.example.com/pokemon/7", None)
      .unwrap();
    f.link.set(LinkState::Wifi);
    f.connectivity.check_connectivity().await.unwrap();

    for _ in 0..2 {
      assert_eq!(f.sync.sync().await.unwrap().failed, 1);
      assert_eq!(f.sync.status(), SyncStatus::Completed);
    }
    let report = f.sync.sync().await.unwrap();

    assert_eq!(report.dropped, 0);
    assert_eq!(f.sync.status(), SyncStatus::Error);
    assert_eq!(f.sync.pending_count(), 1);
    assert_eq!(f.sync.entries()[0].retry_count, 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_retry_needs_started_triggers() {
    let f = fixture(LinkState::None).await;
    let count = Arc::new(AtomicUsize::new(0));
    f.sync.register_handler("fetch", counting_handler(count.clone(), Ok(())));
    f.sync.queue_offline_operation("https://api.example.com/pokemon/25").unwrap();

    f.sync.sync().await.unwrap();
    assert_eq!(f.sync.status(), SyncStatus::WaitingForConnection);
    assert!(lock(&f.sync.inner.retry).is_none());

    f.sync.start();
    f.sync.sync().await.unwrap();
    assert!(lock(&f.sync.inner.retry).is_some());
    f.sync.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_missing_handler_counts_as_failure() {
    let f = fixture(LinkState::None).await;
    f.sync
      .add_to_sync_queue("unknown", "https://api.example.com/pokemon/7", None)
      .unwrap();
    f.link.set(LinkState::Wifi);
    f.connectivity.check_connectivity().await.unwrap();

    let report = f.sync.sync().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(f.sync.entries()[0].retry_count, 1);
    f.sync.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_sync_is_noop() {
    let f = fixture(LinkState::None).await;
    let gate = Arc::new(Notify::new());
    let handler_gate = gate.clone();
    f.sync.register_handler(
      "fetch",
      Arc::new(move |_entry| {
        let gate = handler_gate.clone();
        async move {
          gate.notified().await;
          Ok(())
        }
        .boxed()
      }),
    );
    f.sync.queue_offline_operation("https://api.example.com/pokemon/25").unwrap();
    f.link.set(LinkState::Wifi);
    f.connectivity.check_connectivity().await.unwrap();

    let running = {
      let sync = f.sync.clone();
      tokio::spawn(async move { sync.sync().await })
    };
    tokio::task::yield_now().await;
    assert_eq!(f.sync.status(), SyncStatus::Syncing);

    assert_eq!(f.sync.sync().await.unwrap(), SyncReport::default());

    gate.notify_one();
    assert_eq!(running.await.unwrap().unwrap().succeeded, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_triggers_sync() {
    let f = fixture(LinkState::None).await;
    let count = Arc::new(AtomicUsize::new(0));
    f.sync.register_handler("fetch", counting_handler(count.clone(), Ok(())));
    f.sync.queue_offline_operation("https://api.example.com/pokemon/25").unwrap();
    f.sync.start();
    tokio::task::yield_now().await;

    f.link.set(LinkState::Wifi);
    f.connectivity.check_connectivity().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(f.sync.pending_count(), 0);
    f.sync.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_handler_refreshes_cache() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(200, r#"{"id": 25, "name": "pikachu"}"#);
    let cache = CacheManager::new(CacheConfig::default(), f.store.clone());
    cache.initialize().await.unwrap();
    let requests = RequestManager::new(RequestConfig::default());

    let handler = fetch_handler(requests, f.transport.clone(), cache.clone(), Duration::from_secs(5));
    f.sync.register_handler(FETCH_OPERATION, handler);
    f.sync.stop();
    f.sync.queue_offline_operation("https://api.example.com/pokemon/25").unwrap();
    f.sync.sync().await.unwrap();

    let cached: Option<Value> = cache
      .get(&endpoint_key("https://api.example.com/pokemon/25"))
      .unwrap();
    assert_eq!(cached, Some(serde_json::json!({"id": 25, "name": "pikachu"})));
  }
}
