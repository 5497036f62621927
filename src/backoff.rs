//! Exponential backoff shared by the request scheduler, the sync outbox and
//! the connectivity poller.

use std::time::Duration;

/// Doubling backoff with a ceiling.
///
/// `delay(n) = min(base * 2^n, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
  pub base: Duration,
  pub max: Duration,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self::new(Duration::from_secs(1), Duration::from_secs(30))
  }
}

impl BackoffPolicy {
  pub fn new(base: Duration, max: Duration) -> Self {
    Self { base, max }
  }

  /// Delay before attempt number `attempt + 1` (attempt 0 is the first retry).
  pub fn delay(&self, attempt: u32) -> Duration {
    // 2^20 is already far past any sensible ceiling
    let factor = 1u32 << attempt.min(20);
    self.base.saturating_mul(factor).min(self.max)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_delay_doubles() {
    let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10));
    assert_eq!(policy.delay(0), Duration::from_millis(100));
    assert_eq!(policy.delay(1), Duration::from_millis(200));
    assert_eq!(policy.delay(3), Duration::from_millis(800));
  }

  #[test]
  fn test_delay_is_capped() {
    let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5));
    assert_eq!(policy.delay(10), Duration::from_secs(5));
    assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
  }
}
