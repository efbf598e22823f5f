//! Rate limit middleware layer.

use axum::extract::Request;
use axum::response::Response;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::trace;

use super::response::{apply_rate_limit_headers, apply_retry_after, store_failure_response};
use crate::ratelimit::{Evaluation, RateLimitConfig, RateLimiter, RequestDescriptor, RouteTable};

/// Where the middleware finds the policy for a request.
#[derive(Debug, Clone)]
enum PolicySource {
    /// One policy for every request through the layer
    Fixed(Arc<RateLimitConfig>),
    /// Policy chosen by request path
    Routes(Arc<RouteTable>),
}

impl PolicySource {
    fn select(&self, path: &str) -> Option<Arc<RateLimitConfig>> {
        match self {
            PolicySource::Fixed(config) => Some(config.clone()),
            PolicySource::Routes(table) => table.find(path),
        }
    }
}

/// Layer that throttles requests before they reach the wrapped service.
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    policy: PolicySource,
}

impl RateLimitLayer {
    /// Guard every request with one policy.
    pub fn new(limiter: Arc<RateLimiter>, config: RateLimitConfig) -> Self {
        Self {
            limiter,
            policy: PolicySource::Fixed(Arc::new(config)),
        }
    }

    /// Pick the policy for each request from a route table.
    /// Requests matching no route pass through unlimited.
    pub fn for_routes(limiter: Arc<RateLimiter>, routes: Arc<RouteTable>) -> Self {
        Self {
            limiter,
            policy: PolicySource::Routes(routes),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
            policy: self.policy.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    policy: PolicySource,
}

impl<S> Service<Request> for RateLimitMiddleware<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let limiter = self.limiter.clone();
        let policy = self.policy.select(req.uri().path());
        // The readied service handles this request; the clone waits for the next one.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let Some(config) = policy else {
                trace!(route = %req.uri().path(), "No rate limit rule for route");
                return inner.call(req).await;
            };

            let descriptor = RequestDescriptor::from_request(&req);

            match limiter.evaluate(&descriptor, &config).await {
                Ok(Evaluation::Decided(decision)) if decision.allowed => {
                    let mut response = inner.call(req).await?;
                    apply_rate_limit_headers(response.headers_mut(), &decision);
                    Ok(response)
                }
                Ok(Evaluation::Decided(decision)) => {
                    let mut response = config
                        .on_limit_exceeded()
                        .on_limit_exceeded(&descriptor, &decision);
                    let headers = response.headers_mut();
                    apply_rate_limit_headers(headers, &decision);
                    apply_retry_after(headers, &decision);
                    Ok(response)
                }
                Ok(Evaluation::Bypassed) => inner.call(req).await,
                Err(_) => Ok(store_failure_response()),
            }
        })
    }
}
