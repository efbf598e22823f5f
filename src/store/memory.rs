//! Process-local window store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

use super::{window_millis, WindowStore};
use crate::error::StoreUnavailableError;
use crate::ratelimit::{Clock, SystemClock};

/// Event timestamps for one key, oldest first.
#[derive(Debug, Default)]
struct WindowLog {
    events: VecDeque<u64>,
    expires_at: u64,
}

impl WindowLog {
    fn prune(&mut self, now: u64, window: u64) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        while self.events.front().is_some_and(|&t| t <= cutoff) {
            self.events.pop_front();
        }
    }

    fn record(&mut self, now: u64, window: u64) {
        // Callers on other threads may observe slightly older clocks.
        let idx = self.events.partition_point(|&t| t <= now);
        self.events.insert(idx, now);
        self.expires_at = self.expires_at.max(now.saturating_add(window));
    }

    fn len(&self) -> u64 {
        self.events.len() as u64
    }
}

/// A window store that lives in this process only.
///
/// Each key's log sits behind its map shard lock, which is held for the
/// whole prune/record/count step. Limits are not shared with other
/// instances; use the Redis store for that.
#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    windows: DashMap<String, WindowLog>,
    closed: AtomicBool,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop keys whose expiry has passed.
    pub fn purge_expired(&self, now_millis: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, log| log.expires_at > now_millis);
        before.saturating_sub(self.windows.len())
    }

    /// Number of keys currently held.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Periodically purge expired keys until the store is closed or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                if store.is_closed() {
                    break;
                }
                let purged = store.purge_expired(SystemClock.now_millis());
                if purged > 0 {
                    debug!(purged = purged, "Purged expired rate limit windows");
                }
            }
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StoreUnavailableError> {
        if self.is_closed() {
            Err(StoreUnavailableError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn record_and_count(
        &self,
        key: &str,
        now_millis: u64,
        window: Duration,
    ) -> Result<u64, StoreUnavailableError> {
        self.ensure_open()?;
        let window = window_millis(window);

        let mut log = self.windows.entry(key.to_string()).or_default();
        log.prune(now_millis, window);
        log.record(now_millis, window);
        let count = log.len();

        trace!(key = %key, count = count, "Recorded window event");
        Ok(count)
    }

    async fn record_if_below(
        &self,
        key: &str,
        now_millis: u64,
        window: Duration,
        max: u64,
    ) -> Result<u64, StoreUnavailableError> {
        self.ensure_open()?;
        let window = window_millis(window);

        let mut log = self.windows.entry(key.to_string()).or_default();
        log.prune(now_millis, window);
        let existing = log.len();
        if existing < max {
            log.record(now_millis, window);
        }

        trace!(key = %key, count = existing + 1, "Evaluated window event");
        Ok(existing + 1)
    }

    async fn ping(&self) -> Result<(), StoreUnavailableError> {
        self.ensure_open()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.windows.clear();
    }
}
