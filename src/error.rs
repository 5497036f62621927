//! Error taxonomy for the API access layer.
//!
//! Internal managers return `Result<_, ApiError>` and let errors propagate to
//! their direct caller. Only the `ApiHelper` façade absorbs them into an
//! `ApiResponse`.

use thiserror::Error;

/// Errors produced anywhere in the access layer.
///
/// `Clone` so a single network result can be shared between coalesced callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
  /// No reachable network and nothing usable in the cache.
  #[error("no internet connection")]
  NoInternet,

  /// Operation exceeded its deadline.
  #[error("timed out: {0}")]
  Timeout(String),

  /// A cancellation token fired.
  #[error("cancelled: {0}")]
  Cancelled(String),

  /// Non-success HTTP status.
  #[error("HTTP {code}: {message}")]
  HttpStatus { code: u16, message: String },

  /// Socket/connection level failure reported by the transport.
  #[error("connection error: {0}")]
  Connection(String),

  /// The endpoint's rate-limit queue is saturated.
  #[error("rate limit queue full for {endpoint}")]
  RateLimitOverflow { endpoint: String },

  /// A work queue rejected an item because it is full.
  #[error("queue is full (max {max_size} items)")]
  QueueOverflow { max_size: usize },

  /// Dequeue on an empty queue.
  #[error("queue is empty")]
  QueueEmpty,

  /// Stored value was written with a different type tag than requested.
  #[error("cache entry {key} holds {found}, requested {expected}")]
  CacheTypeMismatch {
    key: String,
    expected: String,
    found: String,
  },

  /// A single value exceeds the whole cache budget.
  #[error("cache entry {key} is too large ({size} bytes, max {max})")]
  CacheEntryTooLarge { key: String, size: usize, max: usize },

  /// A request with the same id is still pending.
  #[error("request {0} is already in progress")]
  AlreadyInProgress(String),

  #[error("{0} is not initialized")]
  NotInitialized(&'static str),

  #[error("{0} has been disposed")]
  Disposed(&'static str),

  /// Response body or cached data could not be parsed.
  #[error("parse error: {0}")]
  Parse(String),

  /// Persistent storage failure.
  #[error("storage error: {0}")]
  Storage(String),

  /// Anything else.
  #[error("unexpected error: {0}")]
  Unexpected(String),
}

impl ApiError {
  /// Build an `HttpStatus` error using the fixed status message table.
  pub fn from_status(code: u16) -> Self {
    ApiError::HttpStatus {
      code,
      message: status_message(code).to_string(),
    }
  }

  /// Whether a failed operation may be attempted again.
  ///
  /// Server errors (5xx), timeouts, connection failures and unclassified
  /// errors are retryable; everything else is terminal.
  pub fn is_retryable(&self) -> bool {
    match self {
      ApiError::Timeout(_) | ApiError::Connection(_) | ApiError::Unexpected(_) => true,
      ApiError::HttpStatus { code, .. } => *code >= 500,
      _ => false,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, ApiError::Cancelled(_))
  }

  /// Short human-readable reason used in degradation messages.
  pub fn short_reason(&self) -> String {
    match self {
      ApiError::NoInternet => "no internet connection".to_string(),
      ApiError::Timeout(_) => "timeout".to_string(),
      ApiError::Cancelled(_) => "cancellation".to_string(),
      ApiError::HttpStatus { code, .. } => format!("server error {}", code),
      ApiError::Connection(_) => "connection error".to_string(),
      ApiError::RateLimitOverflow { .. } => "rate limiting".to_string(),
      ApiError::Parse(_) => "invalid response".to_string(),
      other => other.to_string(),
    }
  }
}

impl From<serde_json::Error> for ApiError {
  fn from(e: serde_json::Error) -> Self {
    ApiError::Parse(e.to_string())
  }
}

impl From<color_eyre::Report> for ApiError {
  fn from(e: color_eyre::Report) -> Self {
    ApiError::Storage(e.to_string())
  }
}

impl From<tokio::time::error::Elapsed> for ApiError {
  fn from(e: tokio::time::error::Elapsed) -> Self {
    ApiError::Timeout(e.to_string())
  }
}

/// Fixed status-code-to-message table.
pub fn status_message(code: u16) -> &'static str {
  match code {
    400 => "Bad request",
    401 => "Unauthorized",
    403 => "Forbidden",
    404 => "Not found",
    408 => "Request timeout",
    429 => "Too many requests",
    500 => "Internal server error",
    502 => "Bad gateway",
    503 => "Service unavailable",
    504 => "Gateway timeout",
    _ => "Unexpected status code",
  }
}
