//! Error types for the Ratewarden service.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// Invalid configuration, reported at startup or route registration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared window store could not be reached
    #[error("Store error: {0}")]
    Store(#[from] StoreUnavailableError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RatewardenError {
    fn from(err: config::ConfigError) -> Self {
        RatewardenError::Config(err.to_string())
    }
}

/// Failure to complete an operation against the shared window store.
///
/// Covers network, timeout and protocol failures alike. The store layer
/// never retries on its own; reconnection belongs to the client connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreUnavailableError {
    #[error("connection to window store failed: {0}")]
    Connection(String),

    #[error("window store command timed out after {0:?}")]
    Timeout(Duration),

    #[error("window store protocol error: {0}")]
    Protocol(String),

    #[error("window store is closed")]
    Closed,
}

impl StoreUnavailableError {
    /// Classify a Redis client error. `timeout` is the limit the client was
    /// configured with, reported when the command timed out.
    pub fn from_redis(err: redis::RedisError, timeout: Duration) -> Self {
        if err.is_timeout() {
            StoreUnavailableError::Timeout(timeout)
        } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreUnavailableError::Connection(err.to_string())
        } else {
            StoreUnavailableError::Protocol(err.to_string())
        }
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts_into_service_error() {
        let err: RatewardenError = StoreUnavailableError::Closed.into();
        assert!(matches!(err, RatewardenError::Store(StoreUnavailableError::Closed)));
        assert_eq!(err.to_string(), "Store error: window store is closed");
    }

    #[test]
    fn test_redis_io_error_maps_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = StoreUnavailableError::from_redis(redis::RedisError::from(io), Duration::from_millis(250));
        assert!(matches!(err, StoreUnavailableError::Connection(_)));
    }

    #[test]
    fn test_redis_response_error_maps_to_protocol() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::ResponseError, "WRONGTYPE"));
        let err = StoreUnavailableError::from_redis(redis_err, Duration::from_millis(250));
        assert!(matches!(err, StoreUnavailableError::Protocol(_)));
    }

    #[test]
    fn test_redis_timeout_reports_configured_limit() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = StoreUnavailableError::from_redis(redis::RedisError::from(io), Duration::from_millis(250));
        assert_eq!(err, StoreUnavailableError::Timeout(Duration::from_millis(250)));
        assert_eq!(err.to_string(), "window store command timed out after 250ms");
    }
}
