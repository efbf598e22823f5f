//! HTTP surface: the rate limit middleware, throttling responses and the gateway.

mod app;
mod layer;
mod response;

pub use app::GatewayServer;
pub use layer::{RateLimitLayer, RateLimitMiddleware};
pub use response::{
    apply_rate_limit_headers, apply_retry_after, store_failure_response, LimitExceededHandler,
    TooManyRequests, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
