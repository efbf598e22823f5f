//! Rate limiting logic: identity, policy and decisions.

mod clock;
mod decision;
pub mod identity;
mod limiter;
mod policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::RateLimitDecision;
pub use identity::{
    AddressIdentity, ClientIdentifier, KeyGenerator, PrincipalIdentity, RateLimitKey,
    RequestDescriptor,
};
pub use limiter::{Evaluation, RateLimiter};
pub use policy::{
    KeyStrategy, RateLimitConfig, RateLimitConfigBuilder, RouteRule, RouteTable, MAX_WINDOW,
};
