//! HTTP transport boundary.
//!
//! The access layer only ever needs "send a GET, give me status + body". The
//! trait keeps the managers independent of the HTTP client so tests can
//! substitute a scripted transport.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tracing::debug;

use crate::error::ApiError;

/// An HTTP response described as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: String,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }

  /// Any 2xx. Enough for a reachability probe.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// A 200 carrying a body. Other 2xx codes are not data responses.
  pub fn is_ok(&self) -> bool {
    self.status == 200
  }
}

/// Request headers as ordered name/value pairs.
pub type Headers = Vec<(String, String)>;

/// Trait for anything that can perform a bounded GET.
pub trait Transport: Send + Sync {
  /// Send a GET request. Fails with `Timeout` or `Connection` on transport errors.
  fn send_get<'a>(
    &'a self,
    url: &'a str,
    headers: &'a [(String, String)],
    timeout: Duration,
  ) -> BoxFuture<'a, Result<HttpResponse, ApiError>>;
}

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(user_agent: &str) -> Result<Self, ApiError> {
    let client = reqwest::Client::builder()
      .user_agent(user_agent)
      .build()
      .map_err(|e| ApiError::Unexpected(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

impl Transport for HttpTransport {
  fn send_get<'a>(
    &'a self,
    url: &'a str,
    headers: &'a [(String, String)],
    timeout: Duration,
  ) -> BoxFuture<'a, Result<HttpResponse, ApiError>> {
    async move {
      let mut request = self.client.get(url).timeout(timeout);
      for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
      }

      let response = request.send().await.map_err(classify_reqwest_error)?;
      let status = response.status().as_u16();
      let body = response.text().await.map_err(classify_reqwest_error)?;

      debug!(url, status, bytes = body.len(), "GET completed");
      Ok(HttpResponse { status, body })
    }
    .boxed()
  }
}

fn classify_reqwest_error(e: reqwest::Error) -> ApiError {
  if e.is_timeout() {
    ApiError::Timeout(e.to_string())
  } else if e.is_connect() || e.is_request() || e.is_body() {
    ApiError::Connection(e.to_string())
  } else {
    ApiError::Unexpected(e.to_string())
  }
}
