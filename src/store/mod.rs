//! Shared window storage.
//!
//! A window store keeps one ordered log of event timestamps per rate limit
//! key. Every instance of the service talks to the same store, and the store
//! is the only place where cross-request state lives, so each operation here
//! must prune, record and count as one indivisible step per key.

mod memory;
mod redis;

pub use self::memory::InMemoryWindowStore;
pub use self::redis::RedisWindowStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{RatewardenError, Result, StoreUnavailableError};

/// Atomic sliding-window log operations shared by all service instances.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Drop events at or before `now - window`, record an event at `now`,
    /// refresh the key's expiry to `window` and return the number of events
    /// left in the window.
    async fn record_and_count(
        &self,
        key: &str,
        now_millis: u64,
        window: Duration,
    ) -> std::result::Result<u64, StoreUnavailableError>;

    /// Like [`record_and_count`](Self::record_and_count), but only records
    /// the event when fewer than `max` events are already in the window.
    ///
    /// Returns the in-window count plus one, whether or not the event was
    /// recorded, so `count <= max` means it was.
    async fn record_if_below(
        &self,
        key: &str,
        now_millis: u64,
        window: Duration,
        max: u64,
    ) -> std::result::Result<u64, StoreUnavailableError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> std::result::Result<(), StoreUnavailableError>;

    /// Release the store. Later operations fail with `Closed`.
    async fn close(&self);
}

/// Open the configured store backend.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn WindowStore>> {
    match config.backend {
        StoreBackend::Redis => {
            let store = RedisWindowStore::open(config).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            if config.sweep_interval().is_zero() {
                return Err(RatewardenError::Config(
                    "store.sweep_interval_secs must be positive".into(),
                ));
            }
            info!("Using process-local window store; limits are not shared across instances");
            let store = Arc::new(InMemoryWindowStore::new());
            store.spawn_sweeper(config.sweep_interval());
            Ok(store)
        }
    }
}

pub(crate) fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

/// Stores that simulate an unreachable backend.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Fails every operation.
    #[derive(Debug, Default)]
    pub struct UnavailableStore;

    #[async_trait]
    impl WindowStore for UnavailableStore {
        async fn record_and_count(
            &self,
            _key: &str,
            _now_millis: u64,
            _window: Duration,
        ) -> std::result::Result<u64, StoreUnavailableError> {
            Err(StoreUnavailableError::Connection("connection refused".into()))
        }

        async fn record_if_below(
            &self,
            _key: &str,
            _now_millis: u64,
            _window: Duration,
            _max: u64,
        ) -> std::result::Result<u64, StoreUnavailableError> {
            Err(StoreUnavailableError::Connection("connection refused".into()))
        }

        async fn ping(&self) -> std::result::Result<(), StoreUnavailableError> {
            Err(StoreUnavailableError::Connection("connection refused".into()))
        }

        async fn close(&self) {}
    }

    /// Never completes an operation.
    #[derive(Debug, Default)]
    pub struct StalledStore;

    #[async_trait]
    impl WindowStore for StalledStore {
        async fn record_and_count(
            &self,
            _key: &str,
            _now_millis: u64,
            _window: Duration,
        ) -> std::result::Result<u64, StoreUnavailableError> {
            futures::future::pending().await
        }

        async fn record_if_below(
            &self,
            _key: &str,
            _now_millis: u64,
            _window: Duration,
            _max: u64,
        ) -> std::result::Result<u64, StoreUnavailableError> {
            futures::future::pending().await
        }

        async fn ping(&self) -> std::result::Result<(), StoreUnavailableError> {
            futures::future::pending().await
        }

        async fn close(&self) {}
    }
}
