//! Translating decisions into HTTP responses.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::ratelimit::{RateLimitDecision, RequestDescriptor};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Builds the response sent to a throttled client.
///
/// Rate limit headers, including `Retry-After`, are added to whatever
/// response the handler returns.
pub trait LimitExceededHandler: Send + Sync {
    fn on_limit_exceeded(&self, request: &RequestDescriptor, decision: &RateLimitDecision) -> Response;
}

impl<F> LimitExceededHandler for F
where
    F: Fn(&RequestDescriptor, &RateLimitDecision) -> Response + Send + Sync,
{
    fn on_limit_exceeded(&self, request: &RequestDescriptor, decision: &RateLimitDecision) -> Response {
        self(request, decision)
    }
}

/// The default throttling response: `429` with a JSON error body.
#[derive(Debug, Clone, Copy, Default)]
pub struct TooManyRequests;

impl LimitExceededHandler for TooManyRequests {
    fn on_limit_exceeded(&self, _request: &RequestDescriptor, decision: &RateLimitDecision) -> Response {
        let body = json!({
            "error": "Too many requests",
            "retryAfter": decision.retry_after_secs,
        });
        (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
    }
}

/// Response for a fail-closed store outage.
pub fn store_failure_response() -> Response {
    let body = json!({ "error": "Internal server error in rate limiter" });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

/// Set the informational limit, remaining and reset headers.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
}

/// Set the `Retry-After` hint for a rejected request.
pub fn apply_retry_after(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use std::time::Duration;

    fn rejected() -> RateLimitDecision {
        RateLimitDecision::from_count(101, 100, 1_700_000_000_000, Duration::from_secs(60))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_default_handler_body() {
        let request = RequestDescriptor::new(Method::GET, "/");
        let response = TooManyRequests.on_limit_exceeded(&request, &rejected());

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body, json!({ "error": "Too many requests", "retryAfter": 60 }));
    }

    #[tokio::test]
    async fn test_store_failure_body() {
        let response = store_failure_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal server error in rate limiter");
    }

    #[test]
    fn test_headers() {
        let mut headers = HeaderMap::new();
        let decision = rejected();
        apply_rate_limit_headers(&mut headers, &decision);
        apply_retry_after(&mut headers, &decision);

        assert_eq!(headers["x-ratelimit-limit"], "100");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["x-ratelimit-reset"], "1700000060");
        assert_eq!(headers["retry-after"], "60");
    }

    #[test]
    fn test_closure_handler() {
        let handler = |_: &RequestDescriptor, _: &RateLimitDecision| {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        };
        let request = RequestDescriptor::new(Method::GET, "/");
        let response = handler.on_limit_exceeded(&request, &rejected());
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
