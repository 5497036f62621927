//! Per-endpoint sliding-window rate limiting with a FIFO overflow queue.
//!
//! A call is admitted immediately when the endpoint is under its quota for
//! the trailing window, the minimum spacing since the previous request has
//! elapsed, and nobody is already queued. Otherwise the caller waits in the
//! endpoint's queue, which a 100 ms drain task services in arrival order.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::lock;

const COMPONENT: &str = "rate limiter";

/// Quota for a single endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointLimit {
  /// Requests allowed inside any trailing `time_window`.
  pub requests_per_window: usize,
  pub time_window: Duration,
  /// Minimum spacing between two consecutive requests.
  pub minimum_delay: Duration,
}

impl Default for EndpointLimit {
  fn default() -> Self {
    Self {
      requests_per_window: 60,
      time_window: Duration::from_secs(60),
      minimum_delay: Duration::from_millis(100),
    }
  }
}

impl EndpointLimit {
  pub fn per_minute(requests: usize) -> Self {
    Self {
      requests_per_window: requests,
      ..Self::default()
    }
  }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
  /// Applied lazily to endpoints that were never configured.
  pub default_limit: EndpointLimit,
  /// Waiting callers allowed per endpoint before `RateLimitOverflow`.
  pub max_queue_size: usize,
  /// Drain task period.
  pub tick: Duration,
}

impl Default for RateLimiterConfig {
  fn default() -> Self {
    Self {
      default_limit: EndpointLimit::default(),
      max_queue_size: 100,
      tick: Duration::from_millis(100),
    }
  }
}

type Waiter = oneshot::Sender<Result<(), ApiError>>;

struct EndpointState {
  limit: EndpointLimit,
  timestamps: VecDeque<Instant>,
  last_request: Option<Instant>,
  waiters: VecDeque<Waiter>,
  draining: bool,
}

impl EndpointState {
  fn new(limit: EndpointLimit) -> Self {
    Self {
      limit,
      timestamps: VecDeque::new(),
      last_request: None,
      waiters: VecDeque::new(),
      draining: false,
    }
  }

  /// Drop timestamps that slid out of the window.
  fn prune(&mut self, now: Instant) {
    while let Some(oldest) = self.timestamps.front() {
      if now.duration_since(*oldest) >= self.limit.time_window {
        self.timestamps.pop_front();
      } else {
        break;
      }
    }
  }

  fn can_admit(&mut self, now: Instant) -> bool {
    self.prune(now);
    let under_quota = self.timestamps.len() < self.limit.requests_per_window;
    let spaced = self
      .last_request
      .map(|last| now.duration_since(last) >= self.limit.minimum_delay)
      .unwrap_or(true);
    under_quota && spaced
  }

  fn record(&mut self, now: Instant) {
    self.timestamps.push_back(now);
    self.last_request = Some(now);
  }

  fn wait_time(&mut self, now: Instant) -> Duration {
    self.prune(now);

    let window_wait = if self.timestamps.len() >= self.limit.requests_per_window {
      self
        .timestamps
        .front()
        .map(|oldest| (*oldest + self.limit.time_window).saturating_duration_since(now))
        .unwrap_or_default()
    } else {
      Duration::ZERO
    };

    let spacing_wait = self
      .last_request
      .map(|last| (last + self.limit.minimum_delay).saturating_duration_since(now))
      .unwrap_or_default();

    window_wait.max(spacing_wait)
  }
}

/// Sliding-window rate limiter keyed by endpoint.
#[derive(Clone)]
pub struct RateLimiter {
  inner: Arc<LimiterInner>,
}

struct LimiterInner {
  config: RateLimiterConfig,
  endpoints: Mutex<HashMap<String, EndpointState>>,
  disposed: AtomicBool,
}

impl RateLimiter {
  pub fn new(config: RateLimiterConfig) -> Self {
    Self {
      inner: Arc::new(LimiterInner {
        config,
        endpoints: Mutex::new(HashMap::new()),
        disposed: AtomicBool::new(false),
      }),
    }
  }

  /// Configure or re-configure one endpoint. Existing history is kept.
  pub fn initialize_endpoint(&self, endpoint: &str, limit: EndpointLimit) {
    let mut endpoints = lock(&self.inner.endpoints);
    endpoints
      .entry(endpoint.to_string())
      .and_modify(|state| state.limit = limit)
      .or_insert_with(|| EndpointState::new(limit));
    debug!(endpoint, ?limit, "rate limit configured");
  }

  /// Run `operation` once the endpoint admits it.
  ///
  /// Errors from the operation are returned unchanged; the limiter never retries.
  pub async fn execute_rate_limited<T, F, Fut>(&self, endpoint: &str, operation: F) -> Result<T, ApiError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    self.acquire(endpoint).await?;
    operation().await
  }

  /// Wait for an admission slot without running anything.
  pub async fn acquire(&self, endpoint: &str) -> Result<(), ApiError> {
    let rx = {
      if self.inner.disposed.load(Ordering::SeqCst) {
        return Err(ApiError::Disposed(COMPONENT));
      }

      let mut endpoints = lock(&self.inner.endpoints);
      let state = endpoints
        .entry(endpoint.to_string())
        .or_insert_with(|| EndpointState::new(self.inner.config.default_limit));

      let now = Instant::now();
      if state.waiters.is_empty() && state.can_admit(now) {
        state.record(now);
        return Ok(());
      }

      if state.waiters.len() >= self.inner.config.max_queue_size {
        warn!(endpoint, queued = state.waiters.len(), "rate limit queue full");
        return Err(ApiError::RateLimitOverflow {
          endpoint: endpoint.to_string(),
        });
      }

      let (tx, rx) = oneshot::channel();
      state.waiters.push_back(tx);
      debug!(endpoint, position = state.waiters.len(), "request queued by rate limiter");

      if !state.draining {
        state.draining = true;
        self.spawn_drain(endpoint.to_string());
      }

      rx
    };

    rx.await.map_err(|_| ApiError::Disposed(COMPONENT))?
  }

  fn spawn_drain(&self, endpoint: String) {
    let inner = Arc::clone(&self.inner);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(inner.config.tick);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        if !inner.drain_once(&endpoint) {
          break;
        }
      }
      debug!(endpoint = %endpoint, "rate limit queue drained");
    });
  }

  /// How long until the endpoint would admit another request.
  pub fn estimated_wait_time(&self, endpoint: &str) -> Duration {
    let mut endpoints = lock(&self.inner.endpoints);
    match endpoints.get_mut(endpoint) {
      Some(state) => state.wait_time(Instant::now()),
      None => Duration::ZERO,
    }
  }

  /// Requests still available in the current window.
  pub fn remaining_requests(&self, endpoint: &str) -> usize {
    let mut endpoints = lock(&self.inner.endpoints);
    match endpoints.get_mut(endpoint) {
      Some(state) => {
        state.prune(Instant::now());
        state
          .limit
          .requests_per_window
          .saturating_sub(state.timestamps.len())
      }
      None => self.inner.config.default_limit.requests_per_window,
    }
  }

  pub fn queue_len(&self, endpoint: &str) -> usize {
    lock(&self.inner.endpoints)
      .get(endpoint)
      .map(|state| state.waiters.len())
      .unwrap_or(0)
  }

  /// Forget the request history of one endpoint.
  pub fn reset(&self, endpoint: &str) {
    if let Some(state) = lock(&self.inner.endpoints).get_mut(endpoint) {
      state.timestamps.clear();
      state.last_request = None;
    }
  }

  /// Fail every waiting caller and refuse new work.
  pub fn dispose(&self) {
    self.inner.disposed.store(true, Ordering::SeqCst);
    let mut endpoints = lock(&self.inner.endpoints);
    for state in endpoints.values_mut() {
      for waiter in state.waiters.drain(..) {
        let _ = waiter.send(Err(ApiError::Disposed(COMPONENT)));
      }
    }
    endpoints.clear();
  }
}

impl LimiterInner {
  /// Admit queued callers that fit. Returns `false` once the queue is empty.
  fn drain_once(&self, endpoint: &str) -> bool {
    let mut endpoints = lock(&self.endpoints);
    let Some(state) = endpoints.get_mut(endpoint) else {
      return false;
    };

    loop {
      // Callers that gave up no longer hold a slot in line.
      while state.waiters.front().is_some_and(|w| w.is_closed()) {
        state.waiters.pop_front();
      }

      let now = Instant::now();
      if state.waiters.is_empty() || !state.can_admit(now) {
        break;
      }

      if let Some(waiter) = state.waiters.pop_front() {
        if waiter.send(Ok(())).is_ok() {
          state.record(now);
        }
      }
    }

    if state.waiters.is_empty() {
      state.draining = false;
      false
    } else {
      true
    }
  }
}
