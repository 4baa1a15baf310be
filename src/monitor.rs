//! Violation monitor: bounded feeds of denials and admitted WebSocket
//! upgrades, plus running aggregates.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::{DEFAULT_CONNECTION_LOG_CAPACITY, DEFAULT_VIOLATION_CAPACITY};
use crate::identity::{ClientIdentity, EndpointKey};

/// Distinct keys kept per violation breakdown before new keys are folded
/// into [`OVERFLOW_BUCKET`].
pub const DEFAULT_BREAKDOWN_CAPACITY: usize = 1_000;

/// Breakdown key that absorbs violations for keys past the capacity.
pub const OVERFLOW_BUCKET: &str = "other";

/// One denied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub client_id: String,
    pub endpoint: String,
    /// `<limit>/<period>` of the rule that denied.
    pub rule_descriptor: String,
    pub timestamp_ms: u64,
}

/// One admitted WebSocket upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionAttempt {
    pub client_id: String,
    pub endpoint: String,
    pub timestamp_ms: u64,
}

/// Point-in-time aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub total_violations: u64,
    /// Per-endpoint, per-client and per-rule counts each hold at most the
    /// breakdown capacity of distinct keys plus [`OVERFLOW_BUCKET`].
    pub violations_by_endpoint: BTreeMap<String, u64>,
    pub violations_by_client: BTreeMap<String, u64>,
    pub violations_by_rule: BTreeMap<String, u64>,
    /// Violations dropped from the recent feed; still counted above.
    pub evicted_violations: u64,
    pub admitted_connections: u64,
    /// Requests admitted because the counter store failed.
    pub store_failures: u64,
    pub last_violation_ms: Option<u64>,
}

impl Statistics {
    /// Clients with the most violations, highest first. Ties sort by id.
    /// The overflow bucket is not a client and is left out.
    pub fn top_clients(&self, n: usize) -> Vec<(String, u64)> {
        let mut clients: Vec<_> = self
            .violations_by_client
            .iter()
            .filter(|(c, _)| c.as_str() != OVERFLOW_BUCKET)
            .map(|(c, n)| (c.clone(), *n))
            .collect();
        clients.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        clients.truncate(n);
        clients
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    violations: VecDeque<Violation>,
    connections: VecDeque<ConnectionAttempt>,
    stats: Statistics,
}

/// Concurrency-safe violation log. Clones share state.
///
/// Each operation takes one short lock, so readers never see a partially
/// applied record. Oldest entries are evicted first once a feed is full.
#[derive(Clone, Debug)]
pub struct ViolationMonitor {
    state: Arc<Mutex<MonitorState>>,
    store_failures: Arc<AtomicU64>,
    violation_capacity: usize,
    connection_capacity: usize,
    breakdown_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl ViolationMonitor {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_VIOLATION_CAPACITY, DEFAULT_CONNECTION_LOG_CAPACITY)
    }

    pub fn with_capacity(violation_capacity: usize, connection_capacity: usize) -> Self {
        Self::with_clock(violation_capacity, connection_capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(
        violation_capacity: usize,
        connection_capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState::default())),
            store_failures: Arc::new(AtomicU64::new(0)),
            violation_capacity: violation_capacity.max(1),
            connection_capacity: connection_capacity.max(1),
            breakdown_capacity: DEFAULT_BREAKDOWN_CAPACITY,
            clock,
        }
    }

    /// Cap the distinct keys tracked per violation breakdown.
    pub fn with_breakdown_capacity(mut self, capacity: usize) -> Self {
        self.breakdown_capacity = capacity.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn log_violation(
        &self,
        client: &ClientIdentity,
        endpoint: &EndpointKey,
        rule_descriptor: &str,
    ) {
        let violation = Violation {
            client_id: client.as_str().to_string(),
            endpoint: endpoint.to_string(),
            rule_descriptor: rule_descriptor.to_string(),
            timestamp_ms: self.clock.now_millis(),
        };
        tracing::warn!(
            target: "quotagate::monitor",
            client = %violation.client_id,
            endpoint = %violation.endpoint,
            rule = %violation.rule_descriptor,
            "rate limit violation"
        );

        let cap = self.breakdown_capacity;
        let mut state = self.lock();
        let stats = &mut state.stats;
        stats.total_violations += 1;
        bump(&mut stats.violations_by_endpoint, &violation.endpoint, cap);
        bump(&mut stats.violations_by_client, &violation.client_id, cap);
        bump(&mut stats.violations_by_rule, &violation.rule_descriptor, cap);
        stats.last_violation_ms = Some(violation.timestamp_ms);

        if state.violations.len() == self.violation_capacity {
            state.violations.pop_front();
            state.stats.evicted_violations += 1;
        }
        state.violations.push_back(violation);
    }

    /// Up to `count` most recent violations, newest first.
    pub fn recent_violations(&self, count: usize) -> Vec<Violation> {
        self.lock().violations.iter().rev().take(count).cloned().collect()
    }

    pub fn record_connection(&self, client: &ClientIdentity, endpoint: &EndpointKey) {
        let attempt = ConnectionAttempt {
            client_id: client.as_str().to_string(),
            endpoint: endpoint.to_string(),
            timestamp_ms: self.clock.now_millis(),
        };
        tracing::debug!(
            target: "quotagate::monitor",
            client = %attempt.client_id,
            endpoint = %attempt.endpoint,
            "websocket connection admitted"
        );

        let mut state = self.lock();
        state.stats.admitted_connections += 1;
        if state.connections.len() == self.connection_capacity {
            state.connections.pop_front();
        }
        state.connections.push_back(attempt);
    }

    /// Up to `count` most recent admitted upgrades, newest first.
    pub fn recent_connections(&self, count: usize) -> Vec<ConnectionAttempt> {
        self.lock().connections.iter().rev().take(count).cloned().collect()
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = self.lock().stats.clone();
        stats.store_failures = self.store_failures.load(Ordering::Relaxed);
        stats
    }

    pub fn violation_capacity(&self) -> usize {
        self.violation_capacity
    }
}

fn bump(counts: &mut BTreeMap<String, u64>, key: &str, capacity: usize) {
    if let Some(count) = counts.get_mut(key) {
        *count += 1;
        return;
    }
    let tracked = counts.len() - usize::from(counts.contains_key(OVERFLOW_BUCKET));
    let bucket = if tracked < capacity { key } else { OVERFLOW_BUCKET };
    *counts.entry(bucket.to_string()).or_default() += 1;
}

impl Default for ViolationMonitor {
    fn default() -> Self {
        Self::new()
    }
}
