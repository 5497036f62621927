//! Cooperative, broadcastable one-shot cancellation.
//!
//! A `CancellationToken` is shared by cloning. Exactly one transition
//! `active -> cancelled` ever happens; every listener registered before that
//! point runs once, and listeners registered afterwards run immediately.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::ApiError;
use crate::lock;

/// Handle returned by [`CancellationToken::add_listener`].
pub type ListenerId = u64;

type Listener = Box<dyn FnOnce(&str) + Send>;

const COMPONENT: &str = "cancellation token";

/// One-shot cancellation signal.
#[derive(Clone)]
pub struct CancellationToken {
  inner: Arc<TokenInner>,
}

struct TokenInner {
  state: Mutex<TokenState>,
  signal: watch::Sender<bool>,
}

#[derive(Default)]
struct TokenState {
  cancelled: bool,
  disposed: bool,
  reason: Option<String>,
  cancelled_at: Option<DateTime<Utc>>,
  listeners: Vec<(ListenerId, Listener)>,
  next_listener: ListenerId,
  timers: Vec<JoinHandle<()>>,
}

impl Default for CancellationToken {
  fn default() -> Self {
    Self::new()
  }
}

impl CancellationToken {
  pub fn new() -> Self {
    let (signal, _) = watch::channel(false);
    Self {
      inner: Arc::new(TokenInner {
        state: Mutex::new(TokenState::default()),
        signal,
      }),
    }
  }

  /// Token that cancels itself after `duration`.
  ///
  /// Must be called from within a tokio runtime.
  pub fn with_timeout(duration: Duration) -> Self {
    let token = Self::new();
    let weak = Arc::downgrade(&token.inner);

    let timer = tokio::spawn(async move {
      tokio::time::sleep(duration).await;
      if let Some(inner) = weak.upgrade() {
        CancellationToken { inner }.cancel(format!("timed out after {}", format_duration(duration)));
      }
    });

    let mut state = lock(&token.inner.state);
    if state.cancelled {
      timer.abort();
    } else {
      state.timers.push(timer);
    }
    drop(state);

    token
  }

  /// Token cancelled as soon as any of `tokens` is cancelled.
  ///
  /// The combined token carries the reason of whichever input fired first.
  pub fn from_multiple(tokens: &[CancellationToken]) -> Self {
    let combined = Self::new();
    let mut registrations: Vec<(Weak<TokenInner>, ListenerId)> = Vec::with_capacity(tokens.len());

    for source in tokens {
      let target = combined.clone();
      match source.add_listener(move |reason| target.cancel(reason)) {
        Ok(id) => registrations.push((Arc::downgrade(&source.inner), id)),
        Err(_) => combined.cancel("disposed"),
      }
    }

    // Detach from the remaining sources once the combined token fires.
    let _ = combined.add_listener(move |_| {
      for (source, id) in registrations {
        if let Some(inner) = source.upgrade() {
          CancellationToken { inner }.remove_listener(id);
        }
      }
    });

    combined
  }

  pub fn is_cancelled(&self) -> bool {
    lock(&self.inner.state).cancelled
  }

  pub fn is_disposed(&self) -> bool {
    lock(&self.inner.state).disposed
  }

  pub fn reason(&self) -> Option<String> {
    lock(&self.inner.state).reason.clone()
  }

  pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
    lock(&self.inner.state).cancelled_at
  }

  /// Cancel the token. Only the first call has any effect.
  pub fn cancel(&self, reason: impl Into<String>) {
    let reason = reason.into();

    let (listeners, timers) = {
      let mut state = lock(&self.inner.state);
      if state.cancelled {
        return;
      }
      state.cancelled = true;
      state.reason = Some(reason.clone());
      state.cancelled_at = Some(Utc::now());
      (
        std::mem::take(&mut state.listeners),
        std::mem::take(&mut state.timers),
      )
    };

    self.inner.signal.send_replace(true);
    for timer in timers {
      timer.abort();
    }

    debug!(reason = %reason, listeners = listeners.len(), "cancellation token fired");
    for (id, listener) in listeners {
      invoke_listener(id, listener, &reason);
    }
  }

  /// Register a callback for cancellation.
  ///
  /// Runs the callback immediately when the token is already cancelled.
  pub fn add_listener<F>(&self, listener: F) -> Result<ListenerId, ApiError>
  where
    F: FnOnce(&str) + Send + 'static,
  {
    let mut state = lock(&self.inner.state);
    if state.disposed {
      return Err(ApiError::Disposed(COMPONENT));
    }

    let id = state.next_listener;
    state.next_listener += 1;

    if state.cancelled {
      let reason = state.reason.clone().unwrap_or_default();
      drop(state);
      invoke_listener(id, Box::new(listener), &reason);
    } else {
      state.listeners.push((id, Box::new(listener)));
    }

    Ok(id)
  }

  /// Returns `true` if a pending listener was removed.
  pub fn remove_listener(&self, id: ListenerId) -> bool {
    let mut state = lock(&self.inner.state);
    let before = state.listeners.len();
    state.listeners.retain(|(listener_id, _)| *listener_id != id);
    state.listeners.len() != before
  }

  pub fn throw_if_cancelled(&self) -> Result<(), ApiError> {
    let state = lock(&self.inner.state);
    if state.cancelled {
      Err(ApiError::Cancelled(
        state.reason.clone().unwrap_or_default(),
      ))
    } else {
      Ok(())
    }
  }

  /// Resolve once the token is cancelled.
  pub async fn cancelled(&self) {
    let mut rx = self.inner.signal.subscribe();
    // The sender lives as long as `self`, so this only returns on cancellation.
    let _ = rx.wait_for(|cancelled| *cancelled).await;
  }

  /// Race `future` against cancellation.
  ///
  /// If the token fires first the future is dropped and `Cancelled` is returned.
  pub async fn wrap_future<F, T>(&self, future: F) -> Result<T, ApiError>
  where
    F: Future<Output = T>,
  {
    self.throw_if_cancelled()?;

    tokio::select! {
      biased;
      _ = self.cancelled() => Err(self.cancelled_error()),
      value = future => Ok(value),
    }
  }

  /// Like [`wrap_future`](Self::wrap_future) for fallible operations.
  pub async fn guard<F, T>(&self, future: F) -> Result<T, ApiError>
  where
    F: Future<Output = Result<T, ApiError>>,
  {
    self.wrap_future(future).await?
  }

  /// Cancel with reason "disposed" and release every resource.
  ///
  /// Further `add_listener` calls fail with `Disposed`.
  pub fn dispose(&self) {
    self.cancel("disposed");

    let mut state = lock(&self.inner.state);
    state.disposed = true;
    state.listeners.clear();
    for timer in state.timers.drain(..) {
      timer.abort();
    }
  }

  fn cancelled_error(&self) -> ApiError {
    ApiError::Cancelled(self.reason().unwrap_or_default())
  }
}

impl std::fmt::Debug for CancellationToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = lock(&self.inner.state);
    f.debug_struct("CancellationToken")
      .field("cancelled", &state.cancelled)
      .field("reason", &state.reason)
      .field("listeners", &state.listeners.len())
      .finish_non_exhaustive()
  }
}

/// A panicking listener is logged and must not stop the remaining ones.
fn invoke_listener(id: ListenerId, listener: Listener, reason: &str) {
  if catch_unwind(AssertUnwindSafe(|| listener(reason))).is_err() {
    error!(listener = id, "cancellation listener panicked");
  }
}

fn format_duration(duration: Duration) -> String {
  if duration.subsec_millis() == 0 {
    format!("{}s", duration.as_secs())
  } else {
    format!("{}ms", duration.as_millis())
  }
}
