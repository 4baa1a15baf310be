//! Counter store abstraction.
//!
//! A store keeps one fixed-window counter per [`CounterKey`] and must offer
//! increment-check-expire as a single atomic step. The in-memory
//! implementation is only correct within one process; shared deployments use
//! a networked backend such as `quotagate-redis`.

pub mod memory;

use std::fmt;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::identity::{ClientIdentity, EndpointKey};
use crate::rules::Period;

pub use memory::InMemoryCounterStore;

/// Counter family. HTTP and WebSocket quotas for the same endpoint never share
/// a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Http,
    WebSocket,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Http => "http",
            Namespace::WebSocket => "ws",
        }
    }
}

/// Identifies one fixed-window counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub namespace: Namespace,
    pub client: ClientIdentity,
    pub endpoint: EndpointKey,
    pub period: Period,
}

impl CounterKey {
    pub fn new(
        namespace: Namespace,
        client: ClientIdentity,
        endpoint: EndpointKey,
        period: Period,
    ) -> Self {
        Self { namespace, client, endpoint, period }
    }

    /// Flat key for external stores. The client id is wrapped in `{}` so every
    /// counter of one client hashes to the same cluster slot.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!(
            "{prefix}:{}:{}:{}:{}",
            client_tag(&self.client),
            self.namespace.as_str(),
            self.endpoint,
            self.period
        )
    }
}

/// `{<client>}` hash tag shared by every key of one client.
pub fn client_tag(client: &ClientIdentity) -> String {
    format!("{{{}}}", client.as_str())
}

/// State of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    pub count: u64,
    pub window_start_ms: u64,
    pub reset_at_ms: u64,
}

impl CounterRecord {
    /// A new window opened at `now_ms` with nothing counted yet.
    pub fn open(now_ms: u64, period: Period) -> Self {
        Self { count: 0, window_start_ms: now_ms, reset_at_ms: now_ms + period.as_millis() }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.reset_at_ms
    }
}

/// Result of [`CounterStore::increment_and_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub allowed: bool,
    /// Counter state after the call.
    pub record: CounterRecord,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} count={} reset_at_ms={}",
            if self.allowed { "allowed" } else { "denied" },
            self.record.count,
            self.record.reset_at_ms
        )
    }
}

/// Shared storage for fixed-window counters.
///
/// Implementations must make [`increment_and_check`] atomic per key: the
/// counter is incremented only while it is below `limit`, and a window whose
/// reset time has passed is replaced by a fresh one in the same step. Denied
/// checks leave the count untouched.
///
/// [`increment_and_check`]: CounterStore::increment_and_check
#[async_trait]
pub trait CounterStore: Send + Sync + fmt::Debug {
    async fn increment_and_check(
        &self,
        key: &CounterKey,
        limit: u64,
    ) -> Result<CheckOutcome, StoreError>;

    /// Current window without counting. `None` when no live window exists.
    async fn peek(&self, key: &CounterKey) -> Result<Option<CounterRecord>, StoreError>;

    /// Drop every counter of `client`, returning how many were removed.
    async fn reset_client(&self, client: &ClientIdentity) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn storage_key_separates_namespaces() {
        let endpoint = EndpointKey::new(&Method::GET, "/gameHub");
        let client = ClientIdentity::user("42");
        let http = CounterKey::new(Namespace::Http, client, endpoint.clone(), Period::Minute);
        let ws = CounterKey { namespace: Namespace::WebSocket, ..http.clone() };

        assert_eq!(http.storage_key("qg"), "qg:{user:42}:http:get:/gamehub:1m");
        assert_eq!(ws.storage_key("qg"), "qg:{user:42}:ws:get:/gamehub:1m");
        assert_ne!(http, ws);
    }

    #[test]
    fn open_window_expires_after_period() {
        let record = CounterRecord::open(1_000, Period::Second);
        assert_eq!(record.reset_at_ms, 2_000);
        assert!(!record.is_expired(1_999));
        assert!(record.is_expired(2_000));
    }
}
