//! Redis counter store for `quotagate` (companion crate).
//! Bring your own `redis::aio::MultiplexedConnection`, or connect from a URL.
//!
//! Each check runs one Lua script, so reading the window, opening a fresh one
//! with its expiry, and the conditional increment happen as a single server-side
//! step shared by every gateway instance. All keys of one client carry the same
//! `{client}` hash tag and live in one cluster slot.

use std::sync::Arc;

use async_trait::async_trait;
use quotagate::store::client_tag;
use quotagate::{
    CheckOutcome, Clock, ClientIdentity, CounterKey, CounterRecord, CounterStore, StoreError,
    SystemClock,
};
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Script};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "quotagate";

const CHECK_SCRIPT: &str = r#"
local key = KEYS[1]
local index = KEYS[2]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])

local ttl = redis.call('PTTL', key)
if ttl < 0 then
  redis.call('SET', key, 0, 'PX', window_ms)
  ttl = window_ms
  redis.call('SADD', index, key)
  if redis.call('PTTL', index) < window_ms then
    redis.call('PEXPIRE', index, window_ms)
  end
end

local count = tonumber(redis.call('GET', key))
local allowed = 0
if count < limit then
  count = redis.call('INCR', key)
  allowed = 1
end
return {allowed, count, ttl}
"#;

const RESET_SCRIPT: &str = r#"
local removed = 0
for _, key in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  removed = removed + redis.call('DEL', key)
end
redis.call('DEL', KEYS[1])
return removed
"#;

#[derive(Clone)]
pub struct RedisCounterStore {
    prefix: String,
    conn: MultiplexedConnection,
    check: Script,
    reset: Script,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("prefix", &self.prefix)
            .field("conn", &"<redis::aio::MultiplexedConnection>")
            .finish()
    }
}

impl RedisCounterStore {
    /// Create a store over an existing connection; keys will be
    /// `prefix:{client}:...`.
    ///
    /// # Errors
    /// Returns `Err` if the prefix is empty or contains whitespace or control
    /// characters.
    pub fn new(prefix: impl Into<String>, conn: MultiplexedConnection) -> Result<Self, String> {
        let prefix: String = prefix.into();
        let prefix = prefix.trim().trim_end_matches(':').to_string();

        if prefix.is_empty() {
            return Err("prefix cannot be empty".to_string());
        }
        if prefix.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err("prefix cannot contain whitespace or control characters".to_string());
        }

        Ok(Self {
            prefix,
            conn,
            check: Script::new(CHECK_SCRIPT),
            reset: Script::new(RESET_SCRIPT),
            clock: Arc::new(SystemClock),
        })
    }

    /// Open a multiplexed connection to `url` and wrap it with the default
    /// prefix.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let conn = client.get_multiplexed_async_connection().await.map_err(store_error)?;
        tracing::info!(target: "quotagate::redis", url = %url, "connected counter store");
        Self::new(DEFAULT_PREFIX, conn).map_err(StoreError::Backend)
    }

    /// Clock used to turn remaining TTLs into absolute reset times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn index_key(&self, client: &ClientIdentity) -> String {
        format!("{}:{}:index", self.prefix, client_tag(client))
    }

    fn record(&self, key: &CounterKey, count: u64, ttl_ms: u64) -> CounterRecord {
        let reset_at_ms = self.clock.now_millis() + ttl_ms;
        CounterRecord {
            count,
            window_start_ms: reset_at_ms.saturating_sub(key.period.as_millis()),
            reset_at_ms,
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_check(
        &self,
        key: &CounterKey,
        limit: u64,
    ) -> Result<CheckOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let (allowed, count, ttl_ms): (u8, u64, i64) = self
            .check
            .key(key.storage_key(&self.prefix))
            .key(self.index_key(&key.client))
            .arg(limit)
            .arg(key.period.as_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        let ttl_ms = u64::try_from(ttl_ms).unwrap_or_default();
        Ok(CheckOutcome { allowed: allowed == 1, record: self.record(key, count, ttl_ms) })
    }

    async fn peek(&self, key: &CounterKey) -> Result<Option<CounterRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let storage_key = key.storage_key(&self.prefix);
        let (count, ttl_ms): (Option<u64>, i64) = redis::pipe()
            .atomic()
            .get(&storage_key)
            .pttl(&storage_key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        Ok(match (count, u64::try_from(ttl_ms)) {
            (Some(count), Ok(ttl_ms)) if ttl_ms > 0 => Some(self.record(key, count, ttl_ms)),
            _ => None,
        })
    }

    async fn reset_client(&self, client: &ClientIdentity) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let removed: usize = self
            .reset
            .key(self.index_key(client))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed)
    }
}

fn store_error(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        StoreError::Unavailable(err.to_string())
    } else if err.is_timeout() {
        StoreError::Unavailable(format!("timed out: {err}"))
    } else {
        StoreError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_touch_only_declared_keys() {
        assert!(CHECK_SCRIPT.contains("KEYS[1]"));
        assert!(CHECK_SCRIPT.contains("KEYS[2]"));
        assert!(!CHECK_SCRIPT.contains("KEYS[3]"));
        assert!(RESET_SCRIPT.contains("SMEMBERS"));
    }

    #[test]
    fn backend_errors_map_to_backend() {
        let err = RedisError::from((redis::ErrorKind::TypeError, "bad reply"));
        assert!(matches!(store_error(err), StoreError::Backend(_)));
    }

    #[test]
    fn io_errors_map_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(store_error(RedisError::from(io)), StoreError::Unavailable(_)));
    }
}
