//! Priority request scheduler with retry, backoff and a global concurrency cap.
//!
//! Requests are deduplicated by id: while a request with a given id is
//! pending, another submission with the same id is rejected. Callers should
//! use ids that name an idempotent logical operation, such as the URL.
//!
//! A dispatcher task ticks every 100 ms (and wakes on every enqueue), pulling
//! from the high, normal and low tiers in strict order while fewer than
//! `max_concurrent_requests` are in flight. Lower tiers can starve under a
//! continuous stream of high priority requests.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::cancellation::CancellationToken;
use crate::error::ApiError;
use crate::lock;
use crate::queue::{Priority, PriorityQueues};

const COMPONENT: &str = "request manager";

#[derive(Debug, Clone)]
pub struct RequestConfig {
  pub max_concurrent_requests: usize,
  pub default_timeout: Duration,
  pub default_max_retries: u32,
  pub backoff: BackoffPolicy,
  /// Requests waiting longer than this before their first attempt fail with `Timeout`.
  pub queue_timeout: Duration,
  /// Dispatcher period.
  pub tick: Duration,
}

impl Default for RequestConfig {
  fn default() -> Self {
    Self {
      max_concurrent_requests: 4,
      default_timeout: Duration::from_secs(30),
      default_max_retries: 3,
      backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
      queue_timeout: Duration::from_secs(120),
      tick: Duration::from_millis(100),
    }
  }
}

/// Per-request overrides. `None` fields fall back to [`RequestConfig`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
  pub priority: Priority,
  pub timeout: Option<Duration>,
  pub max_retries: Option<u32>,
  pub token: Option<CancellationToken>,
}

impl RequestOptions {
  pub fn with_priority(priority: Priority) -> Self {
    Self {
      priority,
      ..Self::default()
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEventKind {
  Queued,
  Processing,
  Completed,
  Retrying,
  Failed,
  Cancelled,
}

/// Lifecycle notification published on the event stream.
#[derive(Debug, Clone)]
pub struct RequestEvent {
  pub id: String,
  pub kind: RequestEventKind,
  pub priority: Priority,
  pub retry_count: u32,
  pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStats {
  pub queued_high: usize,
  pub queued_normal: usize,
  pub queued_low: usize,
  pub in_flight: usize,
  pub pending: usize,
}

type Attempt = Box<dyn Fn() -> BoxFuture<'static, Result<(), ApiError>> + Send + Sync>;
type Completion = Box<dyn FnOnce(Result<(), ApiError>) + Send>;

struct QueuedRequest {
  id: String,
  priority: Priority,
  enqueued_at: Instant,
  timeout: Duration,
  max_retries: u32,
  retry_count: u32,
  token: CancellationToken,
  attempt: Attempt,
  complete: Completion,
}

/// Scheduler handle. Cheap to clone.
#[derive(Clone)]
pub struct RequestManager {
  inner: Arc<RequestInner>,
}

struct RequestInner {
  config: RequestConfig,
  queues: Mutex<PriorityQueues<QueuedRequest>>,
  /// Tokens of every request between submission and completion.
  pending: Mutex<HashMap<String, CancellationToken>>,
  in_flight: AtomicUsize,
  events: broadcast::Sender<RequestEvent>,
  wake: Arc<Notify>,
  dispatcher: Mutex<Option<JoinHandle<()>>>,
  disposed: AtomicBool,
}

impl RequestManager {
  pub fn new(config: RequestConfig) -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      inner: Arc::new(RequestInner {
        config,
        queues: Mutex::new(PriorityQueues::new()),
        pending: Mutex::new(HashMap::new()),
        in_flight: AtomicUsize::new(0),
        events,
        wake: Arc::new(Notify::new()),
        dispatcher: Mutex::new(None),
        disposed: AtomicBool::new(false),
      }),
    }
  }

  /// Schedule `operation` and wait for its final outcome.
  ///
  /// The operation is invoked once per attempt, so it must be re-callable.
  pub async fn execute_request<T, F, Fut>(
    &self,
    id: impl Into<String>,
    operation: F,
    options: RequestOptions,
  ) -> Result<T, ApiError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    T: Send + 'static,
  {
    if self.inner.disposed.load(Ordering::SeqCst) {
      return Err(ApiError::Disposed(COMPONENT));
    }

    let id = id.into();
    let token = options.token.unwrap_or_default();
    {
      let mut pending = lock(&self.inner.pending);
      if pending.contains_key(&id) {
        debug!(id = %id, "duplicate request rejected");
        return Err(ApiError::AlreadyInProgress(id));
      }
      pending.insert(id.clone(), token.clone());
    }

    let (tx, rx) = oneshot::channel();
    let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));

    let attempt: Attempt = {
      let slot = Arc::clone(&slot);
      Box::new(move || {
        let future = operation();
        let slot = Arc::clone(&slot);
        async move {
          let value = future.await?;
          *lock(&slot) = Some(value);
          Ok(())
        }
        .boxed()
      })
    };

    let complete: Completion = Box::new(move |outcome| {
      let result = outcome.and_then(|()| {
        lock(&slot)
          .take()
          .ok_or_else(|| ApiError::Unexpected("request finished without a value".to_string()))
      });
      // The caller may have stopped waiting.
      let _ = tx.send(result);
    });

    let request = QueuedRequest {
      id,
      priority: options.priority,
      enqueued_at: Instant::now(),
      timeout: options.timeout.unwrap_or(self.inner.config.default_timeout),
      max_retries: options
        .max_retries
        .unwrap_or(self.inner.config.default_max_retries),
      retry_count: 0,
      token,
      attempt,
      complete,
    };

    self.inner.enqueue(request);
    self.ensure_dispatcher();

    rx.await
      .unwrap_or_else(|_| Err(ApiError::Cancelled("request dropped".to_string())))
  }

  fn ensure_dispatcher(&self) {
    let mut dispatcher = lock(&self.inner.dispatcher);
    if dispatcher.as_ref().is_some_and(|handle| !handle.is_finished()) {
      return;
    }

    let weak = Arc::downgrade(&self.inner);
    let wake = Arc::clone(&self.inner.wake);
    let tick = self.inner.config.tick;
    *dispatcher = Some(tokio::spawn(run_dispatcher(weak, wake, tick)));
  }

  /// Whether a request with this id is queued, running or backing off.
  pub fn is_pending(&self, id: &str) -> bool {
    lock(&self.inner.pending).contains_key(id)
  }

  /// Cancel one request. Returns `false` if no such request is pending.
  pub fn cancel_request(&self, id: &str) -> bool {
    let token = lock(&self.inner.pending).get(id).cloned();
    let Some(token) = token else {
      return false;
    };
    token.cancel("cancelled by caller");

    let queued = lock(&self.inner.queues).extract_if(|request| request.id == id);
    for request in queued {
      self.inner.finish(request, Err(ApiError::Cancelled("cancelled by caller".to_string())));
    }
    true
  }

  /// Cancel every pending request and empty the queues.
  pub fn cancel_all_requests(&self) {
    let tokens: Vec<CancellationToken> = lock(&self.inner.pending).values().cloned().collect();
    for token in &tokens {
      token.cancel("all requests cancelled");
    }

    let queued = lock(&self.inner.queues).drain_all();
    for request in queued {
      self.inner.finish(
        request,
        Err(ApiError::Cancelled("all requests cancelled".to_string())),
      );
    }

    if !tokens.is_empty() {
      info!(count = tokens.len(), "cancelled all requests");
    }
  }

  /// Subscribe to lifecycle events. Slow subscribers may miss events.
  pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
    self.inner.events.subscribe()
  }

  pub fn stats(&self) -> RequestStats {
    let queues = lock(&self.inner.queues);
    RequestStats {
      queued_high: queues.len_of(Priority::High),
      queued_normal: queues.len_of(Priority::Normal),
      queued_low: queues.len_of(Priority::Low),
      in_flight: self.inner.in_flight.load(Ordering::SeqCst),
      pending: lock(&self.inner.pending).len(),
    }
  }

  /// Cancel everything and stop the dispatcher. Later submissions fail with `Disposed`.
  pub fn dispose(&self) {
    self.inner.disposed.store(true, Ordering::SeqCst);
    self.cancel_all_requests();
    if let Some(handle) = lock(&self.inner.dispatcher).take() {
      handle.abort();
    }
    debug!("request manager disposed");
  }
}

async fn run_dispatcher(weak: Weak<RequestInner>, wake: Arc<Notify>, tick: Duration) {
  let mut ticker = tokio::time::interval(tick);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      _ = ticker.tick() => {}
      _ = wake.notified() => {}
    }

    let Some(inner) = weak.upgrade() else {
      break;
    };
    if inner.disposed.load(Ordering::SeqCst) {
      break;
    }
    inner.dispatch();
  }
}

impl RequestInner {
  fn enqueue(&self, request: QueuedRequest) {
    self.emit(&request, RequestEventKind::Queued, None);
    debug!(id = %request.id, priority = %request.priority, retry = request.retry_count, "request queued");
    lock(&self.queues).push(request.priority, request);
    self.wake.notify_one();
  }

  fn emit(&self, request: &QueuedRequest, kind: RequestEventKind, error: Option<ApiError>) {
    // No subscribers is fine.
    let _ = self.events.send(RequestEvent {
      id: request.id.clone(),
      kind,
      priority: request.priority,
      retry_count: request.retry_count,
      error,
    });
  }

  /// Start as many queued requests as the concurrency cap allows.
  fn dispatch(self: &Arc<Self>) {
    loop {
      if self.in_flight.load(Ordering::SeqCst) >= self.config.max_concurrent_requests {
        break;
      }

      let next = lock(&self.queues).pop();
      let Some((_, request)) = next else {
        break;
      };

      if let Err(e) = request.token.throw_if_cancelled() {
        self.finish(request, Err(e));
        continue;
      }
      if request.enqueued_at.elapsed() > self.config.queue_timeout {
        warn!(id = %request.id, "request expired while queued");
        self.finish(
          request,
          Err(ApiError::Timeout("expired while waiting in queue".to_string())),
        );
        continue;
      }

      self.in_flight.fetch_add(1, Ordering::SeqCst);
      let inner = Arc::clone(self);
      tokio::spawn(async move { inner.process(request).await });
    }
  }

  async fn process(self: Arc<Self>, request: QueuedRequest) {
    self.emit(&request, RequestEventKind::Processing, None);

    let attempt = request.token.guard(async { (request.attempt)().await });
    let attempt = AssertUnwindSafe(attempt).catch_unwind();
    let outcome = match tokio::time::timeout(request.timeout, attempt).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        error!(id = %request.id, "request operation panicked");
        self.finish(request, Err(ApiError::Unexpected("request operation panicked".to_string())));
        self.wake.notify_one();
        return;
      }
      Err(_) => Err(ApiError::Timeout(format!(
        "request {} exceeded {:?}",
        request.id, request.timeout
      ))),
    };
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    match outcome {
      Ok(()) => self.finish(request, Ok(())),
      Err(e) if e.is_cancelled() || request.token.is_cancelled() => {
        let reason = request.token.reason().unwrap_or_else(|| e.to_string());
        self.finish(request, Err(ApiError::Cancelled(reason)));
      }
      Err(e) if e.is_retryable() && request.retry_count < request.max_retries => {
        self.schedule_retry(request, e);
      }
      Err(e) => self.finish(request, Err(e)),
    }

    self.wake.notify_one();
  }

  fn schedule_retry(self: &Arc<Self>, mut request: QueuedRequest, error: ApiError) {
    let delay = self.config.backoff.delay(request.retry_count);
    request.retry_count += 1;
    self.emit(&request, RequestEventKind::Retrying, Some(error.clone()));
    warn!(
      id = %request.id,
      retry = request.retry_count,
      max_retries = request.max_retries,
      ?delay,
      error = %error,
      "request failed, retrying"
    );

    let inner = Arc::clone(self);
    tokio::spawn(async move {
      let token = request.token.clone();
      tokio::select! {
        _ = tokio::time::sleep(delay) => {
          if inner.disposed.load(Ordering::SeqCst) {
            inner.finish(request, Err(ApiError::Disposed(COMPONENT)));
          } else {
            request.enqueued_at = Instant::now();
            inner.enqueue(request);
          }
        }
        _ = token.cancelled() => {
          let reason = token.reason().unwrap_or_default();
          inner.finish(request, Err(ApiError::Cancelled(reason)));
        }
      }
    });
  }

  fn finish(&self, request: QueuedRequest, outcome: Result<(), ApiError>) {
    lock(&self.pending).remove(&request.id);

    let (kind, error) = match &outcome {
      Ok(()) => (RequestEventKind::Completed, None),
      Err(e) if e.is_cancelled() => (RequestEventKind::Cancelled, Some(e.clone())),
      Err(e) => (RequestEventKind::Failed, Some(e.clone())),
    };
    match &error {
      Some(e) if kind == RequestEventKind::Failed => {
        warn!(id = %request.id, error = %e, "request failed")
      }
      _ => debug!(id = %request.id, ?kind, "request finished"),
    }
    self.emit(&request, kind, error);

    (request.complete)(outcome);
  }
}
