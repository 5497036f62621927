//! Scripted collaborators shared by the unit tests.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ApiError;
use crate::transport::{HttpResponse, Transport};

#[derive(Debug, Clone)]
enum Reply {
  Respond(HttpResponse),
  Fail(ApiError),
}

/// Transport that replays queued replies, then falls back to a default.
///
/// With no queued reply and no default it fails with `Connection`.
#[derive(Default)]
pub struct MockTransport {
  script: Mutex<VecDeque<Reply>>,
  fallback: Mutex<Option<Reply>>,
  latency: Mutex<Duration>,
  calls: Mutex<Vec<String>>,
  count: AtomicUsize,
}

impl MockTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn push_response(&self, status: u16, body: &str) {
    self
      .script
      .lock()
      .unwrap()
      .push_back(Reply::Respond(HttpResponse::new(status, body)));
  }

  pub fn push_error(&self, error: ApiError) {
    self.script.lock().unwrap().push_back(Reply::Fail(error));
  }

  pub fn respond_always(&self, status: u16, body: &str) {
    *self.fallback.lock().unwrap() = Some(Reply::Respond(HttpResponse::new(status, body)));
  }

  pub fn fail_always(&self, error: ApiError) {
    *self.fallback.lock().unwrap() = Some(Reply::Fail(error));
  }

  /// Simulated round trip applied to every call.
  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  pub fn call_count(&self) -> usize {
    self.count.load(Ordering::SeqCst)
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

impl Transport for MockTransport {
  fn send_get<'a>(
    &'a self,
    url: &'a str,
    _headers: &'a [(String, String)],
    timeout: Duration,
  ) -> BoxFuture<'a, Result<HttpResponse, ApiError>> {
    async move {
      self.count.fetch_add(1, Ordering::SeqCst);
      self.calls.lock().unwrap().push(url.to_string());

      let latency = *self.latency.lock().unwrap();
      if latency > timeout {
        tokio::time::sleep(timeout).await;
        return Err(ApiError::Timeout(format!("GET {} timed out", url)));
      }
      if !latency.is_zero() {
        tokio::time::sleep(latency).await;
      }

      let scripted = self.script.lock().unwrap().pop_front();
      let reply = scripted.or_else(|| self.fallback.lock().unwrap().clone());
      match reply {
        Some(Reply::Respond(response)) => Ok(response),
        Some(Reply::Fail(error)) => Err(error),
        None => Err(ApiError::Connection("no scripted reply".to_string())),
      }
    }
    .boxed()
  }
}
