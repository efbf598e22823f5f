//! Rate limit policies and route rule configuration.
//!
//! Rules are declared in configuration as [`RouteRule`]s and validated once,
//! when the [`RouteTable`] is built, into immutable [`RateLimitConfig`]s.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::identity::{AddressIdentity, ClientIdentifier, KeyGenerator, PrincipalIdentity};
use crate::error::{RatewardenError, Result};
use crate::server::{LimitExceededHandler, TooManyRequests};

/// Longest window a policy may use. Redis rejects expiries that overflow
/// its millisecond clock, so oversized windows are refused up front.
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Immutable rate limit policy for one protected route.
#[derive(Clone)]
pub struct RateLimitConfig {
    window: Duration,
    max: u64,
    key_generator: Arc<dyn KeyGenerator>,
    skip_failed_requests: bool,
    count_rejected: bool,
    on_limit_exceeded: Arc<dyn LimitExceededHandler>,
    scope: Option<String>,
}

impl std::fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("window", &self.window)
            .field("max", &self.max)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .field("count_rejected", &self.count_rejected)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl RateLimitConfig {
    /// Start building a policy admitting `max` requests per `window`.
    pub fn builder(window: Duration, max: u64) -> RateLimitConfigBuilder {
        RateLimitConfigBuilder {
            window,
            max,
            key_generator: Arc::new(ClientIdentifier::new()),
            skip_failed_requests: false,
            count_rejected: true,
            on_limit_exceeded: Arc::new(TooManyRequests),
            scope: None,
        }
    }

    /// Rolling window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admitted requests per key per window.
    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn key_generator(&self) -> &dyn KeyGenerator {
        self.key_generator.as_ref()
    }

    /// Whether a store outage lets traffic through uncounted.
    pub fn skip_failed_requests(&self) -> bool {
        self.skip_failed_requests
    }

    /// Whether rejected requests still occupy a slot in the window.
    pub fn count_rejected(&self) -> bool {
        self.count_rejected
    }

    pub fn on_limit_exceeded(&self) -> &dyn LimitExceededHandler {
        self.on_limit_exceeded.as_ref()
    }

    /// Optional namespace separating this route's counts from other routes.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
}

/// Builder for [`RateLimitConfig`].
pub struct RateLimitConfigBuilder {
    window: Duration,
    max: u64,
    key_generator: Arc<dyn KeyGenerator>,
    skip_failed_requests: bool,
    count_rejected: bool,
    on_limit_exceeded: Arc<dyn LimitExceededHandler>,
    scope: Option<String>,
}

impl RateLimitConfigBuilder {
    pub fn key_generator(mut self, generator: impl KeyGenerator + 'static) -> Self {
        self.key_generator = Arc::new(generator);
        self
    }

    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    /// Rejected requests are recorded by default. Turning this off means a
    /// blocked client recovers `window` after its last admitted request,
    /// even if it keeps probing.
    pub fn count_rejected(mut self, count: bool) -> Self {
        self.count_rejected = count;
        self
    }

    pub fn on_limit_exceeded(mut self, handler: impl LimitExceededHandler + 'static) -> Self {
        self.on_limit_exceeded = Arc::new(handler);
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Validate and freeze the policy.
    pub fn build(self) -> Result<RateLimitConfig> {
        if self.window.as_millis() == 0 {
            return Err(RatewardenError::Config(
                "window must be at least one millisecond".into(),
            ));
        }
        if self.window > MAX_WINDOW {
            return Err(RatewardenError::Config(format!(
                "window must not exceed {} milliseconds",
                MAX_WINDOW.as_millis()
            )));
        }
        if self.max == 0 {
            return Err(RatewardenError::Config("max must be positive".into()));
        }
        if matches!(self.scope.as_deref(), Some("")) {
            return Err(RatewardenError::Config("scope must not be empty".into()));
        }

        Ok(RateLimitConfig {
            window: self.window,
            max: self.max,
            key_generator: self.key_generator,
            skip_failed_requests: self.skip_failed_requests,
            count_rejected: self.count_rejected,
            on_limit_exceeded: self.on_limit_exceeded,
            scope: self.scope,
        })
    }
}

/// How a route derives the client identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum KeyStrategy {
    /// API key, then forwarded-for, then peer address
    #[default]
    Client,
    /// Forwarded-for, then peer address
    Ip,
    /// A principal header set upstream, falling back to `Client`
    Header { name: String },
}

/// A rate limit rule as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Route prefix the rule protects
    pub route: String,
    /// Rolling window length in milliseconds
    pub window_ms: u64,
    /// Requests admitted per key per window
    pub max: u64,
    #[serde(default)]
    pub key: KeyStrategy,
    #[serde(default)]
    pub skip_failed_requests: bool,
    #[serde(default = "default_count_rejected")]
    pub count_rejected: bool,
    #[serde(default)]
    pub scope: Option<String>,
    /// Optional name/description for this rule
    #[serde(default)]
    pub name: Option<String>,
}

fn default_count_rejected() -> bool {
    true
}

impl RouteRule {
    /// Validate the rule into a policy.
    pub fn to_config(&self, identifier: &ClientIdentifier) -> Result<RateLimitConfig> {
        if !self.route.starts_with('/') {
            return Err(RatewardenError::Config(format!(
                "route '{}' must start with '/'",
                self.route
            )));
        }

        let builder = RateLimitConfig::builder(Duration::from_millis(self.window_ms), self.max)
            .skip_failed_requests(self.skip_failed_requests)
            .count_rejected(self.count_rejected);

        let builder = match &self.key {
            KeyStrategy::Client => builder.key_generator(identifier.clone()),
            KeyStrategy::Ip => builder.key_generator(AddressIdentity::new(identifier.clone())),
            KeyStrategy::Header { name } => {
                builder.key_generator(PrincipalIdentity::new(name, identifier.clone())?)
            }
        };

        let builder = match &self.scope {
            Some(scope) => builder.scope(scope.clone()),
            None => builder,
        };

        builder.build().map_err(|e| match e {
            RatewardenError::Config(reason) => {
                RatewardenError::Config(format!("route '{}': {}", self.route, reason))
            }
            other => other,
        })
    }
}

/// Maps route prefixes to their policies.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    /// Sorted by prefix length, longest first
    routes: Vec<(String, Arc<RateLimitConfig>)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from configured rules, validating each one.
    pub fn from_rules(rules: &[RouteRule], identifier: &ClientIdentifier) -> Result<Self> {
        let mut table = Self::new();
        for rule in rules {
            let config = rule.to_config(identifier)?;
            info!(
                route = %rule.route,
                name = rule.name.as_deref().unwrap_or(""),
                max = config.max(),
                window_ms = rule.window_ms,
                "Registered rate limit rule"
            );
            table.register(&rule.route, config)?;
        }
        Ok(table)
    }

    /// Register a policy for a route prefix.
    pub fn register(&mut self, route: &str, config: RateLimitConfig) -> Result<()> {
        let route = normalize(route);
        if self.routes.iter().any(|(existing, _)| *existing == route) {
            return Err(RatewardenError::Config(format!(
                "duplicate rate limit rule for route '{}'",
                route
            )));
        }
        self.routes.push((route, Arc::new(config)));
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(())
    }

    /// Find the policy for a request path. The longest matching prefix wins.
    pub fn find(&self, path: &str) -> Option<Arc<RateLimitConfig>> {
        self.routes
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(_, config)| config.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn normalize(route: &str) -> String {
    match route.trim_end_matches('/') {
        "" => "/".to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
