//! Client identity resolution and rate limit key generation.

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request};
use std::net::SocketAddr;

use crate::error::{RatewardenError, Result};

pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";
pub const DEFAULT_FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Identity used when neither headers nor the connection name the caller.
const UNKNOWN_CLIENT: &str = "ip:unknown";

/// The parts of an inbound request the limiter looks at.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Route identifier (the request path)
    pub route: String,
    pub headers: HeaderMap,
    /// Address of the directly connected peer, when known
    pub peer_addr: Option<SocketAddr>,
}

impl RequestDescriptor {
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        Self {
            method,
            route: route.into(),
            headers: HeaderMap::new(),
            peer_addr: None,
        }
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        let name = HeaderName::from_bytes(name.as_bytes());
        let value = HeaderValue::from_str(value);
        if let (Ok(name), Ok(value)) = (name, value) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Capture the descriptor from an HTTP request.
    ///
    /// The peer address comes from axum's `ConnectInfo` extension, which is
    /// present when the router is served with connect info.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let peer_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Self {
            method: request.method().clone(),
            route: request.uri().path().to_string(),
            headers: request.headers().clone(),
            peer_addr,
        }
    }
}

/// Strategy that derives the counting identity for a request.
///
/// Any `Fn(&RequestDescriptor) -> String` closure is a key generator, so
/// callers can limit per authenticated principal instead of per address.
pub trait KeyGenerator: Send + Sync {
    fn generate(&self, request: &RequestDescriptor) -> String;
}

impl<F> KeyGenerator for F
where
    F: Fn(&RequestDescriptor) -> String + Send + Sync,
{
    fn generate(&self, request: &RequestDescriptor) -> String {
        self(request)
    }
}

/// Resolves the caller's identity by walking a fixed precedence chain:
/// API key header, then the first forwarded-for address, then the peer address.
#[derive(Debug, Clone)]
pub struct ClientIdentifier {
    api_key_header: HeaderName,
    forwarded_for_header: HeaderName,
}

impl ClientIdentifier {
    pub fn new() -> Self {
        Self {
            api_key_header: HeaderName::from_static(DEFAULT_API_KEY_HEADER),
            forwarded_for_header: HeaderName::from_static(DEFAULT_FORWARDED_FOR_HEADER),
        }
    }

    /// Create an identifier that reads custom header names.
    pub fn with_headers(api_key_header: &str, forwarded_for_header: &str) -> Result<Self> {
        Ok(Self {
            api_key_header: parse_header_name(api_key_header)?,
            forwarded_for_header: parse_header_name(forwarded_for_header)?,
        })
    }

    /// Resolve the identity for a request. Never fails.
    pub fn resolve(&self, request: &RequestDescriptor) -> String {
        if let Some(api_key) = self.api_key(&request.headers) {
            return format!("apikey:{}", api_key);
        }
        self.resolve_address(request)
    }

    /// Resolve the identity from network addresses only.
    pub fn resolve_address(&self, request: &RequestDescriptor) -> String {
        if let Some(forwarded) = self.forwarded_for(&request.headers) {
            return format!("ip:{}", forwarded);
        }
        match request.peer_addr {
            Some(addr) => format!("ip:{}", addr.ip()),
            None => UNKNOWN_CLIENT.to_string(),
        }
    }

    fn api_key<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        header_str(headers, &self.api_key_header)
    }

    fn forwarded_for<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(&self.forwarded_for_header)
            .and_then(|v| v.to_str().ok())
            .and_then(|chain| chain.split(',').map(str::trim).find(|addr| !addr.is_empty()))
    }
}

impl Default for ClientIdentifier {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyGenerator for ClientIdentifier {
    fn generate(&self, request: &RequestDescriptor) -> String {
        self.resolve(request)
    }
}

/// Identity taken from forwarded-for or peer address, ignoring API keys.
#[derive(Debug, Clone, Default)]
pub struct AddressIdentity {
    identifier: ClientIdentifier,
}

impl AddressIdentity {
    pub fn new(identifier: ClientIdentifier) -> Self {
        Self { identifier }
    }
}

impl KeyGenerator for AddressIdentity {
    fn generate(&self, request: &RequestDescriptor) -> String {
        self.identifier.resolve_address(request)
    }
}

/// Identity taken from a header set by an upstream authenticator,
/// e.g. `x-user-id`. Requests without it fall back to the client chain.
#[derive(Debug, Clone)]
pub struct PrincipalIdentity {
    header: HeaderName,
    fallback: ClientIdentifier,
}

impl PrincipalIdentity {
    pub fn new(header: &str, fallback: ClientIdentifier) -> Result<Self> {
        Ok(Self {
            header: parse_header_name(header)?,
            fallback,
        })
    }
}

impl KeyGenerator for PrincipalIdentity {
    fn generate(&self, request: &RequestDescriptor) -> String {
        match header_str(&request.headers, &self.header) {
            Some(principal) => format!("principal:{}", principal),
            None => self.fallback.resolve(request),
        }
    }
}

/// A key that scopes counting to one logical client.
///
/// Rendered as `<prefix>:[<scope>:]<identity>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn new(prefix: &str, scope: Option<&str>, identity: &str) -> Self {
        match scope {
            Some(scope) => Self(format!("{}:{}:{}", prefix, scope, identity)),
            None => Self(format!("{}:{}", prefix, identity)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| RatewardenError::Config(format!("Invalid header name '{}': {}", name, e)))
}
