//! Admission engine: runs the applicable rules against the counter store.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::identity::{ClientIdentity, EndpointKey};
use crate::rules::{Period, RateRule};
use crate::store::{CounterKey, CounterRecord, CounterStore, Namespace};

/// Read view of one counter against one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub client_id: String,
    pub limit: u64,
    pub current_count: u64,
    /// Window end in milliseconds since the Unix epoch.
    pub reset_at_ms: u64,
}

impl RateLimitInfo {
    fn from_record(client: &ClientIdentity, limit: u64, record: CounterRecord) -> Self {
        Self {
            client_id: client.as_str().to_string(),
            limit,
            current_count: record.count,
            reset_at_ms: record.reset_at_ms,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current_count)
    }

    /// Window end as Unix seconds, rounded up.
    pub fn reset_unix_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1_000)
    }
}

/// A rule together with its counter after this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub rule: RateRule,
    pub info: RateLimitInfo,
}

/// Outcome of [`AdmissionEngine::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request.
    Allowed {
        /// Rule with the smallest limit among those checked; drives headers.
        /// `None` when no rule applied or the store failed.
        binding: Option<Quota>,
        /// Counter view per checked period.
        quotas: BTreeMap<Period, RateLimitInfo>,
        /// Set when the store failed and the request was admitted anyway.
        store_error: Option<StoreError>,
    },
    /// Reject the request; `rule` is the first rule over its limit.
    Denied { rule: RateRule, info: RateLimitInfo },
}

impl Decision {
    pub fn unrestricted() -> Self {
        Decision::Allowed { binding: None, quotas: BTreeMap::new(), store_error: None }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn binding(&self) -> Option<&Quota> {
        match self {
            Decision::Allowed { binding, .. } => binding.as_ref(),
            Decision::Denied { .. } => None,
        }
    }

    /// True when admitted only because the store failed.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Decision::Allowed { store_error: Some(_), .. })
    }
}

/// Evaluates ordered rule lists against a [`CounterStore`].
///
/// Every store call is bounded by `store_timeout`. Store failures and
/// timeouts fail open: the request is admitted without quota data.
#[derive(Clone, Debug)]
pub struct AdmissionEngine {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl AdmissionEngine {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self { store, clock, store_timeout }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Check `rules` in order, stopping at the first one over its limit.
    ///
    /// Counts taken for earlier rules in the same call are kept when a later
    /// rule denies.
    pub async fn evaluate(
        &self,
        client: &ClientIdentity,
        endpoint: &EndpointKey,
        rules: &[RateRule],
        namespace: Namespace,
    ) -> Decision {
        let mut quotas = BTreeMap::new();
        let mut binding: Option<Quota> = None;

        for rule in rules {
            let key = CounterKey::new(namespace, client.clone(), endpoint.clone(), rule.period);
            let checked = self.bounded(self.store.increment_and_check(&key, rule.limit)).await;
            let outcome = match checked {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(
                        target: "quotagate::admission",
                        client = %client,
                        endpoint = %endpoint,
                        error = %err,
                        "counter store failed; admitting request"
                    );
                    return Decision::Allowed {
                        binding: None,
                        quotas: BTreeMap::new(),
                        store_error: Some(err),
                    };
                }
            };

            let info = RateLimitInfo::from_record(client, rule.limit, outcome.record);
            if !outcome.allowed {
                return Decision::Denied { rule: rule.clone(), info };
            }

            quotas.insert(rule.period, info.clone());
            if !matches!(&binding, Some(b) if b.rule.limit <= rule.limit) {
                binding = Some(Quota { rule: rule.clone(), info });
            }
        }

        tracing::trace!(
            target: "quotagate::admission",
            client = %client,
            endpoint = %endpoint,
            checked = quotas.len(),
            "admitted"
        );
        Decision::Allowed { binding, quotas, store_error: None }
    }

    /// Quota view for the binding rule without counting a request.
    ///
    /// A missing counter reads as zero with a window that would end one
    /// period from now. Returns `None` when no rule applies.
    pub async fn get_info(
        &self,
        client: &ClientIdentity,
        endpoint: &EndpointKey,
        rules: &[RateRule],
        namespace: Namespace,
    ) -> Result<Option<RateLimitInfo>, StoreError> {
        let Some(rule) = rules.iter().min_by_key(|r| r.limit) else {
            return Ok(None);
        };
        let key = CounterKey::new(namespace, client.clone(), endpoint.clone(), rule.period);
        let record = self
            .bounded(self.store.peek(&key))
            .await?
            .unwrap_or_else(|| CounterRecord::open(self.clock.now_millis(), rule.period));
        Ok(Some(RateLimitInfo::from_record(client, rule.limit, record)))
    }

    /// Drop every counter of `client` in every namespace.
    pub async fn reset(&self, client: &ClientIdentity) -> Result<usize, StoreError> {
        let removed = self.bounded(self.store.reset_client(client)).await?;
        tracing::info!(
            target: "quotagate::admission",
            client = %client,
            removed,
            "client limits reset"
        );
        Ok(removed)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }
}
