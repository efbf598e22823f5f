//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use super::clock::{Clock, SystemClock};
use super::decision::RateLimitDecision;
use super::identity::{RateLimitKey, RequestDescriptor};
use super::policy::RateLimitConfig;
use crate::error::StoreUnavailableError;
use crate::store::WindowStore;

/// Default namespace for rate limit keys.
const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// Result of evaluating a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// The store answered and a decision was made
    Decided(RateLimitDecision),
    /// The store was unavailable and the policy lets traffic through uncounted
    Bypassed,
}

/// Sliding-window-log rate limiter.
///
/// Holds no per-client state itself; every count lives in the injected
/// [`WindowStore`], so any number of limiter instances, in this process or
/// others, can share the same limits.
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    command_timeout: Option<Duration>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("key_prefix", &self.key_prefix)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a rate limiter over a shared window store.
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            command_timeout: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Bound every store round trip. Expiry counts as the store being unavailable.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Build the counting key for a request under a policy.
    pub fn key_for(&self, request: &RequestDescriptor, config: &RateLimitConfig) -> RateLimitKey {
        let identity = config.key_generator().generate(request);
        RateLimitKey::new(&self.key_prefix, config.scope(), &identity)
    }

    /// Evaluate a request, applying the policy's store failure handling.
    ///
    /// Returns an error only when the store is unavailable and the policy
    /// fails closed.
    pub async fn evaluate(
        &self,
        request: &RequestDescriptor,
        config: &RateLimitConfig,
    ) -> Result<Evaluation, StoreUnavailableError> {
        let key = self.key_for(request, config);

        match self.evaluate_key(&key, config).await {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        key = %key,
                        route = %request.route,
                        count = decision.current,
                        limit = decision.limit,
                        "Rate limit exceeded"
                    );
                }
                Ok(Evaluation::Decided(decision))
            }
            Err(e) if config.skip_failed_requests() => {
                warn!(
                    key = %key,
                    route = %request.route,
                    error = %e,
                    "Window store unavailable, admitting request uncounted"
                );
                Ok(Evaluation::Bypassed)
            }
            Err(e) => {
                error!(
                    key = %key,
                    route = %request.route,
                    error = %e,
                    "Window store unavailable, rejecting request"
                );
                Err(e)
            }
        }
    }

    /// Record an event for `key` and decide on it, with no failure handling.
    ///
    /// The event is recorded before the comparison, so with
    /// `count_rejected` set a rejected request still takes a slot.
    pub async fn evaluate_key(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision, StoreUnavailableError> {
        let now = self.clock.now_millis();

        trace!(key = %key, now = now, "Checking rate limit");

        let count = self.record(key, now, config).await?;
        Ok(RateLimitDecision::from_count(count, config.max(), now, config.window()))
    }

    async fn record(
        &self,
        key: &RateLimitKey,
        now: u64,
        config: &RateLimitConfig,
    ) -> Result<u64, StoreUnavailableError> {
        let operation = async {
            if config.count_rejected() {
                self.store
                    .record_and_count(key.as_str(), now, config.window())
                    .await
            } else {
                self.store
                    .record_if_below(key.as_str(), now, config.window(), config.max())
                    .await
            }
        };

        match self.command_timeout {
            Some(limit) => tokio::time::timeout(limit, operation)
                .await
                .map_err(|_| StoreUnavailableError::Timeout(limit))?,
            None => operation.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::store::testing::{StalledStore, UnavailableStore};
    use crate::store::InMemoryWindowStore;
    use axum::http::Method;

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryWindowStore::new())).with_clock(clock)
    }

    fn request_from(ip: &str) -> RequestDescriptor {
        RequestDescriptor::new(Method::GET, "/api/v1/analytics").with_header("x-forwarded-for", ip)
    }

    fn config(window_ms: u64, max: u64) -> RateLimitConfig {
        RateLimitConfig::builder(Duration::from_millis(window_ms), max)
            .build()
            .unwrap()
    }

    fn decided(evaluation: Evaluation) -> RateLimitDecision {
        match evaluation {
            Evaluation::Decided(decision) => decision,
            Evaluation::Bypassed => panic!("expected a decision"),
        }
    }

    #[tokio::test]
    async fn test_key_is_namespaced_client_identity() {
        let limiter = limiter(Arc::new(ManualClock::new(0)));
        let key = limiter.key_for(&request_from("1.2.3.4"), &config(1000, 5));
        assert_eq!(key.as_str(), "ratelimit:ip:1.2.3.4");

        let limiter = limiter.with_key_prefix("gw");
        let scoped = RateLimitConfig::builder(Duration::from_secs(1), 5)
            .scope("reports")
            .build()
            .unwrap();
        let key = limiter.key_for(&request_from("1.2.3.4"), &scoped);
        assert_eq!(key.as_str(), "gw:reports:ip:1.2.3.4");
    }

    #[tokio::test]
    async fn test_sliding_window() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock.clone());
        let config = config(1000, 5);
        let request = request_from("1.2.3.4");

        for i in 1..=5 {
            let decision = decided(limiter.evaluate(&request, &config).await.unwrap());
            assert!(decision.allowed, "request {} should be admitted", i);
        }

        clock.set(500);
        let decision = decided(limiter.evaluate(&request, &config).await.unwrap());
        assert!(!decision.allowed);
        assert_eq!(decision.current, 6);

        // The five events at t=0 have left the window; the rejected one at t=500 remains.
        clock.set(1001);
        let decision = decided(limiter.evaluate(&request, &config).await.unwrap());
        assert!(decision.allowed);
        assert_eq!(decision.current, 2);
    }

    #[tokio::test]
    async fn test_rejected_probes_extend_recovery() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock.clone());
        let config = config(1000, 1);
        let request = request_from("1.2.3.4");

        assert!(decided(limiter.evaluate(&request, &config).await.unwrap()).allowed);

        clock.set(900);
        assert!(!decided(limiter.evaluate(&request, &config).await.unwrap()).allowed);

        // The probe at t=900 still occupies the window.
        clock.set(1500);
        assert!(!decided(limiter.evaluate(&request, &config).await.unwrap()).allowed);
    }

    #[tokio::test]
    async fn test_uncounted_rejections_recover_after_window() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock.clone());
        let config = RateLimitConfig::builder(Duration::from_millis(1000), 1)
            .count_rejected(false)
            .build()
            .unwrap();
        let request = request_from("1.2.3.4");

        assert!(decided(limiter.evaluate(&request, &config).await.unwrap()).allowed);

        clock.set(900);
        let decision = decided(limiter.evaluate(&request, &config).await.unwrap());
        assert!(!decision.allowed);
        assert_eq!(decision.current, 2);

        clock.set(1500);
        assert!(decided(limiter.evaluate(&request, &config).await.unwrap()).allowed);
    }

    #[tokio::test]
    async fn test_decision_fields_are_consistent() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let limiter = limiter(clock.clone());
        let config = config(60_000, 3);
        let request = request_from("1.2.3.4");

        for _ in 0..5 {
            let now = clock.now_millis();
            let decision = decided(limiter.evaluate(&request, &config).await.unwrap());
            assert_eq!(decision.limit, 3);
            assert_eq!(decision.remaining, decision.limit.saturating_sub(decision.current));
            assert!(decision.reset_at >= now && decision.reset_at <= now + 60_000);
            clock.advance(Duration::from_millis(10));
        }
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let limiter = limiter(Arc::new(ManualClock::new(0)));
        let config = config(60_000, 2);
        let a = request_from("1.1.1.1");
        let b = request_from("2.2.2.2");

        for _ in 0..5 {
            limiter.evaluate(&a, &config).await.unwrap();
        }

        let decision = decided(limiter.evaluate(&b, &config).await.unwrap());
        assert!(decision.allowed);
        assert_eq!(decision.current, 1);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(UnavailableStore));
        let config = RateLimitConfig::builder(Duration::from_secs(1), 1)
            .skip_failed_requests(true)
            .build()
            .unwrap();

        for _ in 0..3 {
            let evaluation = limiter.evaluate(&request_from("1.2.3.4"), &config).await;
            assert_eq!(evaluation, Ok(Evaluation::Bypassed));
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let limiter = RateLimiter::new(Arc::new(UnavailableStore));
        let config = config(1000, 1);

        let result = limiter.evaluate(&request_from("1.2.3.4"), &config).await;
        assert!(matches!(result, Err(StoreUnavailableError::Connection(_))));
    }

    #[tokio::test]
    async fn test_command_timeout_is_store_unavailable() {
        let limiter = RateLimiter::new(Arc::new(StalledStore))
            .with_command_timeout(Duration::from_millis(20));
        let config = config(1000, 1);

        let result = limiter.evaluate(&request_from("1.2.3.4"), &config).await;
        assert_eq!(result, Err(StoreUnavailableError::Timeout(Duration::from_millis(20))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_is_bounded() {
        // Several limiter instances share one store, like separate service processes.
        let store: Arc<dyn WindowStore> = Arc::new(InMemoryWindowStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let instances: Vec<Arc<RateLimiter>> = (0..3)
            .map(|_| Arc::new(RateLimiter::new(store.clone()).with_clock(clock.clone())))
            .collect();
        let config = Arc::new(config(60_000, 10));

        let tasks: Vec<_> = (0..90)
            .map(|i| {
                let limiter = instances[i % instances.len()].clone();
                let config = config.clone();
                tokio::spawn(async move {
                    let request = request_from("1.2.3.4");
                    limiter.evaluate(&request, &config).await
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if decided(task.await.unwrap().unwrap()).allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
