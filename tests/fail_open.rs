mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{from_user, header, request, Harness, T0};
use http::{Method, StatusCode};
use quotagate::{
    CheckOutcome, ClientIdentity, CounterKey, CounterRecord, CounterStore, GateError,
    InMemoryCounterStore, ManualClock, StoreError,
};

const RULES: &str = r#"{
    "general_rules": [{"endpoint": "*", "period": "1m", "limit": 1}],
    "websocket_rules": [{"endpoint": "*", "period": "1m", "limit": 1}],
    "store_timeout_ms": 50
}"#;

#[derive(Debug)]
struct DownStore;

#[async_trait]
impl CounterStore for DownStore {
    async fn increment_and_check(
        &self,
        _: &CounterKey,
        _: u64,
    ) -> Result<CheckOutcome, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn peek(&self, _: &CounterKey) -> Result<Option<CounterRecord>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn reset_client(&self, _: &ClientIdentity) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[derive(Debug)]
struct HungStore;

#[async_trait]
impl CounterStore for HungStore {
    async fn increment_and_check(
        &self,
        _: &CounterKey,
        _: u64,
    ) -> Result<CheckOutcome, StoreError> {
        futures::future::pending().await
    }

    async fn peek(&self, _: &CounterKey) -> Result<Option<CounterRecord>, StoreError> {
        futures::future::pending().await
    }

    async fn reset_client(&self, _: &ClientIdentity) -> Result<usize, StoreError> {
        futures::future::pending().await
    }
}

fn harness(backend: Arc<dyn CounterStore>) -> Harness {
    let clock = ManualClock::starting_at(T0);
    let unused = InMemoryCounterStore::with_clock(Arc::new(clock.clone()));
    Harness::with_store(RULES, clock, unused, backend)
}

#[tokio::test]
async fn unreachable_store_admits_without_headers() {
    let h = harness(Arc::new(DownStore));
    for _ in 0..3 {
        let res = h.send(from_user(request(Method::GET, "/"), "7")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(header(&res, "x-ratelimit-limit").is_none());
    }
    assert_eq!(h.echo.hits(), 3);

    let stats = h.gateway.monitor().statistics();
    assert_eq!(stats.store_failures, 3);
    assert_eq!(stats.total_violations, 0);
}

#[tokio::test]
async fn unreachable_store_admits_upgrades() {
    let h = harness(Arc::new(DownStore));
    for _ in 0..2 {
        let res = h.send(common::upgrade("/gameHub", "10.0.0.1")).await;
        assert_eq!(res.status(), StatusCode::OK);
    }
    assert_eq!(h.gateway.monitor().statistics().store_failures, 2);
}

#[tokio::test]
async fn admin_surfaces_store_errors() {
    let h = harness(Arc::new(DownStore));
    let admin = h.gateway.admin();
    assert!(matches!(
        admin.get_info("user:7", "get:/").await,
        Err(GateError::Store(StoreError::Unavailable(_)))
    ));
    assert!(matches!(admin.reset_client_limits("user:7").await, Err(GateError::Store(_))));
}

#[tokio::test(start_paused = true)]
async fn hung_store_times_out_and_admits() {
    let h = harness(Arc::new(HungStore));
    let res = h.send(from_user(request(Method::GET, "/"), "7")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(header(&res, "x-ratelimit-remaining").is_none());
    assert_eq!(h.gateway.monitor().statistics().store_failures, 1);
}
