//! Redis-backed window store.
//!
//! Each key is a sorted set of event members scored by their timestamp.
//! Prune, insert, count and expiry refresh run inside one server-side Lua
//! script, so Redis applies them as a single unit with respect to every
//! other client touching the same key.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Script;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{window_millis, WindowStore};
use crate::config::StoreConfig;
use crate::error::StoreUnavailableError;

/// KEYS[1] = key; ARGV = now, cutoff, window_ms, member
const RECORD_AND_COUNT: &str = r#"
local key = KEYS[1]
redis.call('ZREMRANGEBYSCORE', key, '-inf', ARGV[2])
redis.call('ZADD', key, ARGV[1], ARGV[4])
local count = redis.call('ZCARD', key)
redis.call('PEXPIRE', key, ARGV[3])
return count
"#;

/// KEYS[1] = key; ARGV = now, cutoff, window_ms, member, max
const RECORD_IF_BELOW: &str = r#"
local key = KEYS[1]
redis.call('ZREMRANGEBYSCORE', key, '-inf', ARGV[2])
local count = redis.call('ZCARD', key)
if count < tonumber(ARGV[5]) then
  redis.call('ZADD', key, ARGV[1], ARGV[4])
  redis.call('PEXPIRE', key, ARGV[3])
end
return count + 1
"#;

/// Window store shared by every service instance through Redis.
pub struct RedisWindowStore {
    connection: ConnectionManager,
    record_and_count: Script,
    record_if_below: Script,
    /// Response timeout the connection was configured with
    response_timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisWindowStore {
    /// Connect to Redis and verify the connection with a `PING`.
    ///
    /// Reconnection after a dropped connection is handled by the
    /// connection manager using `reconnect_retries`.
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreUnavailableError> {
        info!(url = %redact(&config.redis_url), "Connecting to Redis window store");

        let client = redis::Client::open(config.redis_url.as_str()).map_err(|e| {
            warn!(error = %e, "Invalid Redis connection settings");
            StoreUnavailableError::Connection(e.to_string())
        })?;

        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.connect_timeout())
            .set_response_timeout(config.command_timeout())
            .set_number_of_retries(config.reconnect_retries);

        let connection = ConnectionManager::new_with_config(client, manager_config)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to connect to Redis window store");
                StoreUnavailableError::from_redis(e, config.connect_timeout())
            })?;

        let store = Self {
            connection,
            record_and_count: Script::new(RECORD_AND_COUNT),
            record_if_below: Script::new(RECORD_IF_BELOW),
            response_timeout: config.command_timeout(),
            closed: AtomicBool::new(false),
        };
        store.ping().await?;

        info!("Connected to Redis window store");
        Ok(store)
    }

    fn ensure_open(&self) -> Result<(), StoreUnavailableError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreUnavailableError::Closed)
        } else {
            Ok(())
        }
    }

    fn unavailable(&self, err: redis::RedisError) -> StoreUnavailableError {
        StoreUnavailableError::from_redis(err, self.response_timeout)
    }
}

/// Sorted set members must be unique, even for events in the same millisecond.
fn event_member(now_millis: u64) -> String {
    format!("{}-{}", now_millis, Uuid::new_v4().simple())
}

/// Scores at or below the cutoff have left the window. Negative when the
/// clock is younger than the window, which prunes nothing.
fn cutoff(now_millis: u64, window_millis: u64) -> i64 {
    let now = i64::try_from(now_millis).unwrap_or(i64::MAX);
    let window = i64::try_from(window_millis).unwrap_or(i64::MAX);
    now.saturating_sub(window)
}

/// Hide credentials embedded in a connection URL.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn record_and_count(
        &self,
        key: &str,
        now_millis: u64,
        window: Duration,
    ) -> Result<u64, StoreUnavailableError> {
        self.ensure_open()?;
        let window = window_millis(window);
        let mut conn = self.connection.clone();

        let count: u64 = self
            .record_and_count
            .key(key)
            .arg(now_millis)
            .arg(cutoff(now_millis, window))
            .arg(window)
            .arg(event_member(now_millis))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.unavailable(e))?;

        debug!(key = %key, count = count, "Recorded window event in Redis");
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
        let mut conn = self.connection.clone();

        let count: u64 = self
            .record_if_below
            .key(key)
            .arg(now_millis)
            .arg(cutoff(now_millis, window))
            .arg(window)
            .arg(event_member(now_millis))
            .arg(max)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.unavailable(e))?;

        debug!(key = %key, count = count, "Evaluated window event in Redis");
        Ok(count)
    }

    async fn ping(&self) -> Result<(), StoreUnavailableError> {
        self.ensure_open()?;
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closed Redis window store");
        }
    }
}
