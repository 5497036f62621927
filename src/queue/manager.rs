//! Generic priority work queue with timed batch draining.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::priority::{Priority, PriorityQueues};
use crate::cancellation::CancellationToken;
use crate::error::ApiError;
use crate::lock;

#[derive(Debug, Clone)]
pub struct QueueConfig {
  /// Items held at once before `QueueOverflow`.
  pub max_size: usize,
  /// Handlers running at the same time while processing.
  pub max_concurrent: usize,
  /// Items handed out per timed batch.
  pub batch_size: usize,
  /// Period of the background batch processor.
  pub process_interval: Duration,
  /// Expiry applied to items enqueued without their own timeout.
  pub default_timeout: Option<Duration>,
  /// Failed handler runs before an item is dropped.
  pub max_retries: u32,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_size: 1000,
      max_concurrent: 3,
      batch_size: 10,
      process_interval: Duration::from_secs(1),
      default_timeout: Some(Duration::from_secs(5 * 60)),
      max_retries: 3,
    }
  }
}

/// Per-item enqueue options.
#[derive(Debug, Clone, Default)]
pub struct ItemOptions {
  pub priority: Priority,
  /// Overrides the queue's default expiry.
  pub timeout: Option<Duration>,
  pub token: Option<CancellationToken>,
}

impl From<Priority> for ItemOptions {
  fn from(priority: Priority) -> Self {
    Self {
      priority,
      ..Self::default()
    }
  }
}

/// A queued payload plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct QueueItem<T> {
  pub id: String,
  pub payload: T,
  pub priority: Priority,
  pub enqueued_at: Instant,
  pub timeout: Option<Duration>,
  pub retry_count: u32,
  pub token: CancellationToken,
}

impl<T> QueueItem<T> {
  pub fn is_expired(&self, now: Instant) -> bool {
    self
      .timeout
      .is_some_and(|timeout| now.duration_since(self.enqueued_at) > timeout)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
  pub pending: usize,
  pub enqueued: u64,
  pub processed: u64,
  pub failed: u64,
  pub expired: u64,
  pub cancelled: u64,
}

/// Priority work queue for any payload type.
///
/// Construct one instance per payload type and share it by cloning.
pub struct QueueManager<T> {
  inner: Arc<QueueInner<T>>,
}

impl<T> Clone for QueueManager<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

struct QueueInner<T> {
  name: String,
  config: QueueConfig,
  queues: Mutex<PriorityQueues<QueueItem<T>>>,
  stats: Mutex<QueueStats>,
  paused: AtomicBool,
  processor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> QueueManager<T> {
  pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
    Self {
      inner: Arc::new(QueueInner {
        name: name.into(),
        config,
        queues: Mutex::new(PriorityQueues::new()),
        stats: Mutex::new(QueueStats::default()),
        paused: AtomicBool::new(false),
        processor: Mutex::new(None),
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  fn make_item(&self, payload: T, options: ItemOptions) -> QueueItem<T> {
    QueueItem {
      id: Uuid::new_v4().to_string(),
      payload,
      priority: options.priority,
      enqueued_at: Instant::now(),
      timeout: options.timeout.or(self.inner.config.default_timeout),
      retry_count: 0,
      token: options.token.unwrap_or_default(),
    }
  }

  /// Add one item. Returns its id.
  pub fn enqueue(&self, payload: T, options: impl Into<ItemOptions>) -> Result<String, ApiError> {
    let item = self.make_item(payload, options.into());
    let id = item.id.clone();

    let mut queues = lock(&self.inner.queues);
    if queues.len() >= self.inner.config.max_size {
      warn!(queue = %self.inner.name, "queue overflow");
      return Err(ApiError::QueueOverflow {
        max_size: self.inner.config.max_size,
      });
    }
    debug!(queue = %self.inner.name, id = %id, priority = %item.priority, "item enqueued");
    queues.push(item.priority, item);
    drop(queues);

    lock(&self.inner.stats).enqueued += 1;
    Ok(id)
  }

  /// Add several items atomically: either all fit or none are queued.
  pub fn enqueue_all<I>(&self, payloads: I, options: ItemOptions) -> Result<Vec<String>, ApiError>
  where
    I: IntoIterator<Item = T>,
  {
    let items: Vec<QueueItem<T>> = payloads
      .into_iter()
      .map(|payload| self.make_item(payload, options.clone()))
      .collect();

    let mut queues = lock(&self.inner.queues);
    if queues.len() + items.len() > self.inner.config.max_size {
      return Err(ApiError::QueueOverflow {
        max_size: self.inner.config.max_size,
      });
    }

    let ids = items.iter().map(|item| item.id.clone()).collect::<Vec<_>>();
    for item in items {
      queues.push(item.priority, item);
    }
    drop(queues);

    lock(&self.inner.stats).enqueued += ids.len() as u64;
    Ok(ids)
  }

  /// Next live item, skipping expired and cancelled ones.
  pub fn try_dequeue(&self) -> Option<QueueItem<T>> {
    let mut queues = lock(&self.inner.queues);
    let now = Instant::now();

    while let Some((_, item)) = queues.pop() {
      if item.token.is_cancelled() {
        debug!(queue = %self.inner.name, id = %item.id, "dropping cancelled item");
        lock(&self.inner.stats).cancelled += 1;
        continue;
      }
      if item.is_expired(now) {
        debug!(queue = %self.inner.name, id = %item.id, "dropping expired item");
        lock(&self.inner.stats).expired += 1;
        continue;
      }
      return Some(item);
    }
    None
  }

  pub fn dequeue(&self) -> Result<QueueItem<T>, ApiError> {
    self.try_dequeue().ok_or(ApiError::QueueEmpty)
  }

  /// Priority and id of the item that would be handed out next.
  pub fn peek(&self) -> Option<(Priority, String)> {
    lock(&self.inner.queues)
      .peek()
      .map(|(priority, item)| (priority, item.id.clone()))
  }

  pub fn len(&self) -> usize {
    lock(&self.inner.queues).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn len_of(&self, priority: Priority) -> usize {
    lock(&self.inner.queues).len_of(priority)
  }

  /// Drop every queued item. Returns how many were removed.
  pub fn clear(&self) -> usize {
    lock(&self.inner.queues).drain_all().len()
  }

  /// Remove one item by id.
  pub fn remove(&self, id: &str) -> bool {
    !lock(&self.inner.queues)
      .extract_if(|item| item.id == id)
      .is_empty()
  }

  pub fn pause(&self) {
    self.inner.paused.store(true, Ordering::SeqCst);
    info!(queue = %self.inner.name, "queue paused");
  }

  pub fn resume(&self) {
    self.inner.paused.store(false, Ordering::SeqCst);
    info!(queue = %self.inner.name, "queue resumed");
  }

  pub fn is_paused(&self) -> bool {
    self.inner.paused.load(Ordering::SeqCst)
  }

  pub fn stats(&self) -> QueueStats {
    QueueStats {
      pending: self.len(),
      ..*lock(&self.inner.stats)
    }
  }

  /// Stop the background processor, if any.
  pub fn stop(&self) {
    if let Some(handle) = lock(&self.inner.processor).take() {
      handle.abort();
      debug!(queue = %self.inner.name, "queue processor stopped");
    }
  }
}

impl<T: Clone + Send + Sync + 'static> QueueManager<T> {
  /// Drain the queue in priority order, running up to `max_concurrent`
  /// handlers at a time. Returns the number of successfully handled items.
  pub async fn process<F, Fut>(&self, handler: F) -> usize
  where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), ApiError>>,
  {
    self.drain(&handler, None).await
  }

  /// Hand out at most one batch (`batch_size` items).
  pub async fn process_batch<F, Fut>(&self, handler: F) -> usize
  where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), ApiError>>,
  {
    self.drain(&handler, Some(self.inner.config.batch_size)).await
  }

  async fn drain<F, Fut>(&self, handler: &F, limit: Option<usize>) -> usize
  where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), ApiError>>,
  {
    let max_concurrent = self.inner.config.max_concurrent.max(1);
    let mut in_flight = FuturesUnordered::new();
    let mut handed_out = 0usize;
    let mut succeeded = 0usize;

    loop {
      while in_flight.len() < max_concurrent
        && !self.is_paused()
        && limit.map_or(true, |limit| handed_out < limit)
      {
        let Some(item) = self.try_dequeue() else {
          break;
        };
        handed_out += 1;
        in_flight.push(async move {
          let result = item.token.guard(handler(item.payload.clone())).await;
          (item, result)
        });
      }

      let Some((item, result)) = in_flight.next().await else {
        break;
      };

      match result {
        Ok(()) => {
          succeeded += 1;
          lock(&self.inner.stats).processed += 1;
        }
        Err(e) => self.handle_failure(item, e),
      }
    }

    succeeded
  }

  fn handle_failure(&self, mut item: QueueItem<T>, error: ApiError) {
    if error.is_cancelled() {
      lock(&self.inner.stats).cancelled += 1;
      return;
    }

    if item.retry_count < self.inner.config.max_retries {
      item.retry_count += 1;
      debug!(
        queue = %self.inner.name,
        id = %item.id,
        retry = item.retry_count,
        error = %error,
        "requeueing failed item"
      );
      lock(&self.inner.queues).push(item.priority, item);
    } else {
      warn!(queue = %self.inner.name, id = %item.id, error = %error, "item failed permanently");
      lock(&self.inner.stats).failed += 1;
    }
  }

  /// Process one batch every `process_interval` until [`stop`](Self::stop).
  pub fn start<F, Fut>(&self, handler: F)
  where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ApiError>> + Send + 'static,
  {
    self.stop();

    let queue = self.clone();
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(queue.inner.config.process_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        if queue.is_paused() || queue.is_empty() {
          continue;
        }
        let handled = queue.drain(&handler, Some(queue.inner.config.batch_size)).await;
        debug!(queue = %queue.inner.name, handled, "batch processed");
      }
    });

    *lock(&self.inner.processor) = Some(handle);
    info!(queue = %self.inner.name, "queue processor started");
  }
}
