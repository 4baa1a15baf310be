use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::{CheckOutcome, CounterKey, CounterRecord, CounterStore};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::identity::ClientIdentity;

/// How often, in store-clock time, a check also sweeps expired windows.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Windows {
    records: HashMap<CounterKey, CounterRecord>,
    next_sweep_ms: u64,
}

impl Windows {
    fn purge(&mut self, now: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        before - self.records.len()
    }
}

/// Process-local counter store.
///
/// Every operation holds one mutex for its whole read-check-write, so it is
/// atomic within this process only. Expired windows are replaced lazily on
/// access, and the first check after each sweep interval drops every expired
/// window, so keys that are never hit again do not accumulate.
#[derive(Clone, Debug)]
pub struct InMemoryCounterStore {
    data: Arc<Mutex<Windows>>,
    clock: Arc<dyn Clock>,
    sweep_every_ms: u64,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Arc::new(Mutex::new(Windows::default())),
            clock,
            sweep_every_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
        }
    }

    /// Change how often checks sweep expired windows.
    pub fn with_sweep_interval(mut self, every: Duration) -> Self {
        self.sweep_every_ms = (every.as_millis() as u64).max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove every window whose reset time has passed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().purge(now)
    }

    /// Number of tracked windows, live or not yet purged.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Run [`purge_expired`](Self::purge_expired) every `every` on the current
    /// runtime. Abort the handle to stop it.
    pub fn spawn_purge_task(&self, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.purge_expired();
                if removed > 0 {
                    tracing::debug!(target: "quotagate::store", removed, "purged expired counters");
                }
            }
        })
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_and_check(
        &self,
        key: &CounterKey,
        limit: u64,
    ) -> Result<CheckOutcome, StoreError> {
        let now = self.clock.now_millis();
        let mut windows = self.lock();
        if now >= windows.next_sweep_ms {
            let removed = windows.purge(now);
            windows.next_sweep_ms = now.saturating_add(self.sweep_every_ms);
            if removed > 0 {
                tracing::debug!(target: "quotagate::store", removed, "swept expired counters");
            }
        }

        let record = windows
            .records
            .entry(key.clone())
            .or_insert_with(|| CounterRecord::open(now, key.period));
        if record.is_expired(now) {
            *record = CounterRecord::open(now, key.period);
        }

        let allowed = record.count < limit;
        if allowed {
            record.count += 1;
        }
        Ok(CheckOutcome { allowed, record: *record })
    }

    async fn peek(&self, key: &CounterKey) -> Result<Option<CounterRecord>, StoreError> {
        let now = self.clock.now_millis();
        Ok(self.lock().records.get(key).filter(|r| !r.is_expired(now)).copied())
    }

    async fn reset_client(&self, client: &ClientIdentity) -> Result<usize, StoreError> {
        let mut windows = self.lock();
        let before = windows.records.len();
        windows.records.retain(|key, _| &key.client != client);
        Ok(before - windows.records.len())
    }
}
