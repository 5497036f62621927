//! Offline-first GET façade over the cache, scheduler, rate limiter,
//! connectivity tracker and sync outbox.
//!
//! `ApiHelper::get` never fails: every outcome, including errors, comes back
//! as an [`ApiResponse`]. The decision order is
//!
//! 1. offline: serve the cache or report `NoInternet` (optionally queuing a
//!    deferred fetch)
//! 2. cached and not forced: serve the cache
//! 3. otherwise fetch through rate limiter, scheduler and transport
//! 4. on any failure fall back to the cache when it has the endpoint

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::cache::{endpoint_key, CacheConfig, CacheManager};
use crate::cancellation::CancellationToken;
use crate::connectivity::{ConnectivityConfig, ConnectivityManager, LinkMonitor};
use crate::error::ApiError;
use crate::lock;
use crate::queue::Priority;
use crate::rate_limiter::{EndpointLimit, RateLimiter, RateLimiterConfig};
use crate::request::{RequestConfig, RequestManager, RequestOptions};
use crate::storage::KeyValueStore;
use crate::sync::{fetch_handler, SyncConfig, SyncManager, FETCH_OPERATION};
use crate::transport::{Headers, Transport};

const COMPONENT: &str = "api helper";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
  Success,
  Error,
}

/// Outcome of a façade call.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
  pub data: Option<T>,
  pub source: ResponseSource,
  pub status: ResponseStatus,
  /// Set on errors, and on cache fallbacks caused by an error.
  pub error: Option<ApiError>,
  pub message: Option<String>,
}

impl<T> ApiResponse<T> {
  fn network(data: T) -> Self {
    Self {
      data: Some(data),
      source: ResponseSource::Network,
      status: ResponseStatus::Success,
      error: None,
      message: None,
    }
  }

  fn cached(data: T, message: Option<String>, error: Option<ApiError>) -> Self {
    Self {
      data: Some(data),
      source: ResponseSource::Cache,
      status: ResponseStatus::Success,
      error,
      message,
    }
  }

  fn failure(error: ApiError) -> Self {
    Self {
      data: None,
      source: ResponseSource::Network,
      status: ResponseStatus::Error,
      message: Some(error.to_string()),
      error: Some(error),
    }
  }

  pub fn is_success(&self) -> bool {
    self.status == ResponseStatus::Success
  }

  pub fn is_from_cache(&self) -> bool {
    self.source == ResponseSource::Cache
  }

  /// The data, or the error that prevented it.
  pub fn into_result(self) -> Result<T, ApiError> {
    match (self.data, self.error) {
      (Some(data), _) => Ok(data),
      (None, Some(error)) => Err(error),
      (None, None) => Err(ApiError::Unexpected("response carried no data".to_string())),
    }
  }
}

#[derive(Debug, Clone)]
pub struct GetOptions {
  pub headers: Headers,
  /// Skip the cache read and go to the network.
  pub force_refresh: bool,
  /// Read and write the cache.
  pub use_cache: bool,
  pub timeout: Duration,
  pub priority: Priority,
  /// On an offline cache miss, queue a deferred fetch for the next sync.
  pub queue_when_offline: bool,
  pub token: Option<CancellationToken>,
}

impl Default for GetOptions {
  fn default() -> Self {
    Self {
      headers: Vec::new(),
      force_refresh: false,
      use_cache: true,
      timeout: Duration::from_secs(30),
      priority: Priority::Normal,
      queue_when_offline: true,
      token: None,
    }
  }
}

/// Settings for every component the façade composes.
#[derive(Debug, Clone)]
pub struct ApiHelperConfig {
  pub cache: CacheConfig,
  pub requests: RequestConfig,
  pub rate_limit: RateLimiterConfig,
  /// Limits keyed by host.
  pub endpoint_limits: HashMap<String, EndpointLimit>,
  pub connectivity: ConnectivityConfig,
  pub sync: SyncConfig,
  /// Timeout for deferred fetches replayed by the sync outbox.
  pub sync_fetch_timeout: Duration,
}

impl Default for ApiHelperConfig {
  fn default() -> Self {
    Self {
      cache: CacheConfig::default(),
      requests: RequestConfig::default(),
      rate_limit: RateLimiterConfig::default(),
      endpoint_limits: HashMap::new(),
      connectivity: ConnectivityConfig::default(),
      sync: SyncConfig::default(),
      sync_fetch_timeout: Duration::from_secs(30),
    }
  }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

/// Composition root and public entry point of the access layer.
#[derive(Clone)]
pub struct ApiHelper {
  inner: Arc<ApiInner>,
}

struct ApiInner {
  transport: Arc<dyn Transport>,
  cache: CacheManager,
  requests: RequestManager,
  rate_limiter: RateLimiter,
  connectivity: ConnectivityManager,
  sync: SyncManager,
  /// Network fetches currently running, keyed by endpoint.
  in_flight: Mutex<HashMap<String, SharedFetch>>,
  initialized: OnceCell<()>,
  disposed: AtomicBool,
}

impl ApiHelper {
  /// Wire up every component. Nothing is loaded until [`ApiHelper::initialize`].
  pub fn new(
    config: ApiHelperConfig,
    transport: Arc<dyn Transport>,
    link: Arc<dyn LinkMonitor>,
    store: Arc<dyn KeyValueStore>,
  ) -> Self {
    let cache = CacheManager::new(config.cache, Arc::clone(&store));
    let requests = RequestManager::new(config.requests);
    let rate_limiter = RateLimiter::new(config.rate_limit);
    for (host, limit) in config.endpoint_limits {
      rate_limiter.initialize_endpoint(&host, limit);
    }
    let connectivity = ConnectivityManager::new(
      config.connectivity,
      Arc::clone(&transport),
      link,
      Arc::clone(&store),
    );
    let sync = SyncManager::new(config.sync, store, connectivity.clone());
    sync.register_handler(
      FETCH_OPERATION,
      fetch_handler(
        requests.clone(),
        Arc::clone(&transport),
        cache.clone(),
        config.sync_fetch_timeout,
      ),
    );

    Self {
      inner: Arc::new(ApiInner {
        transport,
        cache,
        requests,
        rate_limiter,
        connectivity,
        sync,
        in_flight: Mutex::new(HashMap::new()),
        initialized: OnceCell::new(),
        disposed: AtomicBool::new(false),
      }),
    }
  }

  /// Load the cache and the outbox and take a first connectivity reading.
  /// Runs once; concurrent callers wait for the same initialization.
  pub async fn initialize(&self) -> Result<(), ApiError> {
    if self.inner.disposed.load(Ordering::SeqCst) {
      return Err(ApiError::Disposed(COMPONENT));
    }

    self
      .inner
      .initialized
      .get_or_try_init(|| async {
        self.inner.cache.initialize().await?;
        self.inner.sync.initialize().await?;
        let state = self.inner.connectivity.check_connectivity().await?;
        info!(network = %state, "api helper initialized");
        Ok::<(), ApiError>(())
      })
      .await?;
    Ok(())
  }

  /// Start the connectivity monitor and the automatic sync triggers.
  pub fn start(&self) {
    self.inner.connectivity.start();
    self.inner.sync.start();
  }

  fn ensure_ready(&self) -> Result<(), ApiError> {
    if self.inner.disposed.load(Ordering::SeqCst) {
      return Err(ApiError::Disposed(COMPONENT));
    }
    if !self.inner.initialized.initialized() {
      return Err(ApiError::NotInitialized(COMPONENT));
    }
    Ok(())
  }

  /// GET `endpoint` and turn the JSON body into `T` with `parser`.
  pub async fn get<T, P>(&self, endpoint: &str, parser: P, options: GetOptions) -> ApiResponse<T>
  where
    P: Fn(Value) -> Result<T, ApiError>,
  {
    if let Err(e) = self.ensure_ready() {
      return ApiResponse::failure(e);
    }
    let key = endpoint_key(endpoint);

    if !self.inner.connectivity.is_online() {
      if options.use_cache {
        if let Some(data) = self.read_cache(&key, &parser) {
          debug!(endpoint, "offline, serving cache");
          return ApiResponse::cached(data, Some("offline: showing cached data".to_string()), None);
        }
      }
      if options.queue_when_offline {
        if let Err(e) = self.inner.sync.queue_offline_operation(endpoint) {
          warn!(endpoint, error = %e, "failed to queue offline fetch");
        }
      }
      return ApiResponse::failure(ApiError::NoInternet);
    }

    if options.use_cache && !options.force_refresh {
      if let Some(data) = self.read_cache(&key, &parser) {
        debug!(endpoint, "cache hit");
        return ApiResponse::cached(data, None, None);
      }
    }

    let outcome = match self.fetch(endpoint, &options).await {
      Ok(json) => parser(json.clone()).map(|data| (data, json)),
      Err(e) => Err(e),
    };

    match outcome {
      Ok((data, json)) => {
        if options.use_cache {
          if let Err(e) = self.inner.cache.put(&key, &json) {
            warn!(endpoint, error = %e, "failed to cache response");
          }
        }
        ApiResponse::network(data)
      }
      Err(e) => {
        let fallback = if options.use_cache {
          self.read_cache(&key, &parser)
        } else {
          None
        };
        match fallback {
          Some(data) => {
            warn!(endpoint, error = %e, "request failed, serving cache");
            let message = format!("using cached data due to {}", e.short_reason());
            ApiResponse::cached(data, Some(message), Some(e))
          }
          None => {
            debug!(endpoint, error = %e, "request failed");
            let unreachable = matches!(e, ApiError::Timeout(_) | ApiError::Connection(_));
            if unreachable && options.queue_when_offline {
              if let Err(queue_error) = self.inner.sync.queue_offline_operation(endpoint) {
                warn!(endpoint, error = %queue_error, "failed to queue fetch for later");
              }
            }
            ApiResponse::failure(e)
          }
        }
      }
    }
  }

  /// [`ApiHelper::get`] with a serde parser.
  pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str, options: GetOptions) -> ApiResponse<T> {
    self
      .get(endpoint, |value| Ok(serde_json::from_value(value)?), options)
      .await
  }

  fn read_cache<T, P>(&self, key: &str, parser: &P) -> Option<T>
  where
    P: Fn(Value) -> Result<T, ApiError>,
  {
    match self.inner.cache.get::<Value>(key) {
      Ok(Some(value)) => match parser(value) {
        Ok(data) => Some(data),
        Err(e) => {
          debug!(key, error = %e, "cached value rejected by parser");
          None
        }
      },
      Ok(None) => None,
      Err(e) => {
        warn!(key, error = %e, "cache read failed");
        None
      }
    }
  }

  /// Join the running fetch for `endpoint` or start a new one.
  async fn fetch(&self, endpoint: &str, options: &GetOptions) -> Result<Value, ApiError> {
    let shared = {
      let mut in_flight = lock(&self.inner.in_flight);
      match in_flight.get(endpoint) {
        Some(running) => {
          debug!(endpoint, "joining in-flight request");
          running.clone()
        }
        None => {
          let fetch = Self::network_fetch(Arc::clone(&self.inner), endpoint.to_string(), options.clone())
            .boxed()
            .shared();
          in_flight.insert(endpoint.to_string(), fetch.clone());
          fetch
        }
      }
    };
    shared.await
  }

  async fn network_fetch(inner: Arc<ApiInner>, endpoint: String, options: GetOptions) -> Result<Value, ApiError> {
    let bucket = rate_limit_bucket(&endpoint);
    let transport = Arc::clone(&inner.transport);
    let requests = inner.requests.clone();
    let request_options = RequestOptions {
      priority: options.priority,
      timeout: Some(options.timeout),
      max_retries: None,
      token: options.token.clone(),
    };

    let url = endpoint.clone();
    let headers = options.headers;
    let timeout = options.timeout;
    let result = inner
      .rate_limiter
      .execute_rate_limited(&bucket, || {
        requests.execute_request(
          endpoint.clone(),
          move || {
            let transport = Arc::clone(&transport);
            let url = url.clone();
            let headers = headers.clone();
            async move {
              let response = transport.send_get(&url, &headers, timeout).await?;
              if !response.is_ok() {
                return Err(ApiError::from_status(response.status));
              }
              Ok(serde_json::from_str::<Value>(&response.body)?)
            }
          },
          request_options,
        )
      })
      .await;

    lock(&inner.in_flight).remove(&endpoint);
    result
  }

  /// Drop the cached response for one endpoint.
  pub fn clear_cache(&self, endpoint: &str) -> Result<bool, ApiError> {
    self.ensure_ready()?;
    self.inner.cache.remove(&endpoint_key(endpoint))
  }

  pub fn clear_all_cache(&self) -> Result<(), ApiError> {
    self.ensure_ready()?;
    self.inner.cache.clear()
  }

  pub fn cache(&self) -> &CacheManager {
    &self.inner.cache
  }

  pub fn requests(&self) -> &RequestManager {
    &self.inner.requests
  }

  pub fn rate_limiter(&self) -> &RateLimiter {
    &self.inner.rate_limiter
  }

  pub fn connectivity(&self) -> &ConnectivityManager {
    &self.inner.connectivity
  }

  pub fn sync(&self) -> &SyncManager {
    &self.inner.sync
  }

  /// Stop background work and release every component. Later calls report `Disposed`.
  pub fn dispose(&self) {
    if self.inner.disposed.swap(true, Ordering::SeqCst) {
      return;
    }
    self.inner.sync.dispose();
    self.inner.connectivity.dispose();
    self.inner.requests.dispose();
    self.inner.rate_limiter.dispose();
    self.inner.cache.dispose();
    info!("api helper disposed");
  }
}

/// Rate limits apply per host; unparseable endpoints get their own bucket.
fn rate_limit_bucket(endpoint: &str) -> String {
  url::Url::parse(endpoint)
    .ok()
    .and_then(|url| url.host_str().map(str::to_string))
    .unwrap_or_else(|| endpoint.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::{LinkState, ManualLinkMonitor};
  use crate::storage::MemoryStore;
  use crate::test_support::MockTransport;
  use serde::Deserialize;

  const PIKACHU_URL: &str = "https://api.example.com/pokemon/25";
  const PIKACHU: &str = r#"{"id": 25, "name": "pikachu"}"#;

  #[derive(Debug, Deserialize, PartialEq)]
  struct Species {
    id: u32,
    name: String,
  }

  struct Fixture {
    api: ApiHelper,
    transport: Arc<MockTransport>,
    link: Arc<ManualLinkMonitor>,
  }

  async fn fixture(link: LinkState) -> Fixture {
    let transport = MockTransport::new();
    let link = Arc::new(ManualLinkMonitor::new(link));
    let config = ApiHelperConfig {
      connectivity: ConnectivityConfig {
        probe_url: None,
        ..ConnectivityConfig::default()
      },
      ..ApiHelperConfig::default()
    };
    let api = ApiHelper::new(config, transport.clone(), link.clone(), Arc::new(MemoryStore::new()));
    api.initialize().await.unwrap();
    Fixture { api, transport, link }
  }

  async fn go(f: &Fixture, link: LinkState) {
    f.link.set(link);
    f.api.connectivity().check_connectivity().await.unwrap();
  }

  fn name_of(value: Value) -> Result<String, ApiError> {
    value
      .get("name")
      .and_then(Value::as_str)
      .map(str::to_string)
      .ok_or_else(|| ApiError::Parse("missing name".into()))
  }

  #[tokio::test(start_paused = true)]
  async fn test_network_then_cache() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(200, PIKACHU);

    let first = f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;
    assert!(first.is_success());
    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(first.data.as_deref(), Some("pikachu"));

    let second = f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.data.as_deref(), Some("pikachu"));
    assert_eq!(f.transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_force_refresh_bypasses_cache() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(200, PIKACHU);

    f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;
    let refreshed = f
      .api
      .get(
        PIKACHU_URL,
        name_of,
        GetOptions {
          force_refresh: true,
          ..GetOptions::default()
        },
      )
      .await;

    assert_eq!(refreshed.source, ResponseSource::Network);
    assert_eq!(f.transport.call_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_cold_cache_reports_no_internet() {
    let f = fixture(LinkState::None).await;

    let response = f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;

    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error, Some(ApiError::NoInternet));
    assert!(response.data.is_none());
    assert_eq!(f.transport.call_count(), 0);

    let queued = f.api.sync().entries();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].endpoint, PIKACHU_URL);
    assert_eq!(queued[0].operation, FETCH_OPERATION);
    f.api.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_warm_cache_serves_cache() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(200, PIKACHU);
    f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;

    go(&f, LinkState::None).await;
    let response = f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;

    assert!(response.is_success());
    assert!(response.is_from_cache());
    assert_eq!(response.data.as_deref(), Some("pikachu"));
    assert!(response.message.unwrap().contains("offline"));
    assert_eq!(f.transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_error_falls_back_to_cache() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(200, PIKACHU);
    f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;

    f.transport.respond_always(503, "unavailable");
    let response = f
      .api
      .get(
        PIKACHU_URL,
        name_of,
        GetOptions {
          force_refresh: true,
          ..GetOptions::default()
        },
      )
      .await;

    assert!(response.is_success());
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.data.as_deref(), Some("pikachu"));
    assert!(response
      .message
      .as_deref()
      .unwrap()
      .starts_with("using cached data due to"));
    assert_eq!(response.error, Some(ApiError::from_status(503)));
    // One initial fetch, then the first attempt plus three retries.
    assert_eq!(f.transport.call_count(), 5);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_falls_back_to_stale_cache() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(200, PIKACHU);
    f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;

    f.transport.fail_always(ApiError::Timeout("GET timed out".into()));
    let response = f
      .api
      .get(
        PIKACHU_URL,
        name_of,
        GetOptions {
          force_refresh: true,
          ..GetOptions::default()
        },
      )
      .await;

    assert!(response.is_success());
    assert!(response.is_from_cache());
    assert_eq!(response.data.as_deref(), Some("pikachu"));
    assert_eq!(
      response.message.as_deref(),
      Some("using cached data due to timeout")
    );
    assert!(matches!(response.error, Some(ApiError::Timeout(_))));
    assert_eq!(f.api.sync().pending_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_server_cold_cache_is_queued() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(200, PIKACHU);
    f.transport.set_latency(Duration::from_secs(5));

    let response = f
      .api
      .get(
        PIKACHU_URL,
        name_of,
        GetOptions {
          timeout: Duration::from_secs(1),
          ..GetOptions::default()
        },
      )
      .await;

    assert_eq!(response.status, ResponseStatus::Error);
    assert!(response.data.is_none());
    assert!(matches!(response.error, Some(ApiError::Timeout(_))));
    let queued = f.api.sync().entries();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].endpoint, PIKACHU_URL);
    f.api.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failures_retried_until_success() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.push_error(ApiError::Connection("reset by peer".into()));
    f.transport.push_response(503, "unavailable");
    f.transport.push_response(200, PIKACHU);

    let response = f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;

    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(response.data.as_deref(), Some("pikachu"));
    assert_eq!(f.transport.call_count(), 3);
    assert_eq!(f.api.sync().pending_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_content_is_status_error() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(204, "");

    let response = f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;

    assert_eq!(response.error, Some(ApiError::from_status(204)));
    assert_eq!(f.transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_not_found_without_cache_is_error() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(404, "");

    let response = f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;

    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(
      response.error,
      Some(ApiError::HttpStatus {
        code: 404,
        message: "Not found".into()
      })
    );
    assert_eq!(f.transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_parser_error_is_reported() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(200, r#"{"id": 25}"#);

    let response = f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;

    assert_eq!(response.status, ResponseStatus::Error);
    assert!(matches!(response.error, Some(ApiError::Parse(_))));
    assert!(!f.api.cache().contains(&endpoint_key(PIKACHU_URL)).unwrap());
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_gets_share_one_fetch() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(200, PIKACHU);
    f.transport.set_latency(Duration::from_millis(200));

    let (a, b) = tokio::join!(
      f.api.get(PIKACHU_URL, name_of, GetOptions::default()),
      f.api.get(PIKACHU_URL, name_of, GetOptions::default()),
    );

    assert_eq!(a.data.as_deref(), Some("pikachu"));
    assert_eq!(b.data.as_deref(), Some("pikachu"));
    assert_eq!(f.transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_json_typed() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(200, PIKACHU);

    let response: ApiResponse<Species> = f.api.get_json(PIKACHU_URL, GetOptions::default()).await;

    assert_eq!(
      response.into_result(),
      Ok(Species {
        id: 25,
        name: "pikachu".into()
      })
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_fetch_synced_on_reconnect() {
    let f = fixture(LinkState::None).await;
    f.transport.respond_always(200, PIKACHU);
    f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;

    go(&f, LinkState::Wifi).await;
    let report = f.api.sync().sync().await.unwrap();
    assert_eq!(report.succeeded, 1);

    go(&f, LinkState::None).await;
    let response = f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;
    assert_eq!(response.data.as_deref(), Some("pikachu"));
    assert!(response.is_from_cache());
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_cache() {
    let f = fixture(LinkState::Wifi).await;
    f.transport.respond_always(200, PIKACHU);
    f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;

    assert!(f.api.clear_cache(PIKACHU_URL).unwrap());
    assert!(!f.api.clear_cache(PIKACHU_URL).unwrap());
    f.api.get(PIKACHU_URL, name_of, GetOptions::default()).await;
    assert_eq!(f.transport.call_count(), 2);

    f.api.clear_all_cache().unwrap();
    assert_eq!(f.api.cache().stats().entries, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_lifecycle_errors_are_responses() {
    let transport = MockTransport::new();
    let api = ApiHelper::new(
      ApiHelperConfig::default(),
      transport,
      Arc::new(ManualLinkMonitor::new(LinkState::None)),
      Arc::new(MemoryStore::new()),
    );

    let before = api.get(PIKACHU_URL, name_of, GetOptions::default()).await;
    assert_eq!(before.error, Some(ApiError::NotInitialized("api helper")));

    api.initialize().await.unwrap();
    api.dispose();
    let after = api.get(PIKACHU_URL, name_of, GetOptions::default()).await;
    assert_eq!(after.error, Some(ApiError::Disposed("api helper")));
    assert_eq!(api.initialize().await, Err(ApiError::Disposed("api helper")));
  }

  #[test]
  fn test_rate_limit_bucket_is_host() {
    assert_eq!(rate_limit_bucket(PIKACHU_URL), "api.example.com");
    assert_eq!(rate_limit_bucket("not a url"), "not a url");
  }
}
