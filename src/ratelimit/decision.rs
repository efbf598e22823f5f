//! Rate limit decisions.

use serde::Serialize;
use std::time::Duration;

use crate::store::window_millis;

/// The outcome of evaluating one request against its window.
///
/// Derived fresh per request and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests admitted per window
    pub limit: u64,
    /// Events in the window, counting this request
    pub current: u64,
    /// Requests left before the limit is hit
    pub remaining: u64,
    /// When the window ends, in milliseconds since the Unix epoch
    pub reset_at: u64,
    /// Seconds the client should wait before retrying
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    /// Build a decision from the window count observed at `now_millis`.
    pub fn from_count(count: u64, limit: u64, now_millis: u64, window: Duration) -> Self {
        let window_ms = window_millis(window);
        Self {
            allowed: count <= limit,
            limit,
            current: count,
            remaining: limit.saturating_sub(count),
            reset_at: now_millis.saturating_add(window_ms),
            retry_after_secs: window_ms.div_ceil(1000).max(1),
        }
    }

    /// The reset time in seconds since the Unix epoch, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at.div_ceil(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_limit() {
        let decision = RateLimitDecision::from_count(3, 5, 10_000, Duration::from_secs(1));
        assert!(decision.allowed);
        assert_eq!(decision.current, 3);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_at, 11_000);
        assert_eq!(decision.reset_at_secs(), 11);
    }

    #[test]
    fn test_count_equal_to_limit_is_allowed() {
        let decision = RateLimitDecision::from_count(5, 5, 0, Duration::from_secs(1));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_over_limit_saturates_remaining() {
        let decision = RateLimitDecision::from_count(9, 5, 0, Duration::from_secs(60));
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after_secs, 60);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = RateLimitDecision::from_count(2, 1, 0, Duration::from_millis(1500));
        assert_eq!(decision.retry_after_secs, 2);

        let decision = RateLimitDecision::from_count(2, 1, 0, Duration::from_millis(10));
        assert_eq!(decision.retry_after_secs, 1);
    }

    #[test]
    fn test_huge_window_saturates() {
        let decision = RateLimitDecision::from_count(1, 1, 1_000, Duration::MAX);
        assert_eq!(decision.reset_at, u64::MAX);
        assert_eq!(decision.retry_after_secs, u64::MAX.div_ceil(1000));
    }

    #[test]
    fn test_reset_secs_rounds_up() {
        let decision = RateLimitDecision::from_count(1, 1, 1_700_000_000_250, Duration::from_secs(1));
        assert_eq!(decision.reset_at_secs(), 1_700_000_002);
    }
}
