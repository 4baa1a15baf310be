mod common;

use common::{from_ip, from_user, header, request, Harness, T0};
use http::{Method, StatusCode};
use quotagate::{ConfigError, GateError, RateLimitConfig, RuleConfig};

const TWO_PER_MINUTE: &str =
    r#"{"general_rules": [{"endpoint": "*", "period": "1m", "limit": 2}]}"#;

#[tokio::test]
async fn get_info_reads_without_counting() {
    let h = Harness::new(TWO_PER_MINUTE);
    h.send(from_user(request(Method::GET, "/api/players"), "7")).await;

    let admin = h.gateway.admin();
    let first = admin.get_info("user:7", "get:/api/players").await.unwrap().unwrap();
    let second = admin.get_info("7", "/api/players").await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.current_count, 1);
    assert_eq!(first.remaining(), 1);
    assert_eq!(first.reset_at_ms, T0 + 60_000);

    let next = h.send(from_user(request(Method::GET, "/api/players"), "7")).await;
    assert_eq!(header(&next, "x-ratelimit-remaining"), Some("0"));
}

#[tokio::test]
async fn get_info_without_rules_is_none() {
    let h = Harness::new("{}");
    assert!(h.gateway.admin().get_info("user:7", "get:/x").await.unwrap().is_none());
}

#[tokio::test]
async fn reset_readmits_exhausted_client_only() {
    let h = Harness::new(TWO_PER_MINUTE);
    for _ in 0..3 {
        h.send(from_user(request(Method::GET, "/"), "7")).await;
        h.send(from_user(request(Method::GET, "/"), "8")).await;
    }
    assert_eq!(
        h.send(from_user(request(Method::GET, "/"), "7")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let removed = h.gateway.admin().reset_client_limits("user:7").await.unwrap();
    assert_eq!(removed, 1);

    assert_eq!(h.send(from_user(request(Method::GET, "/"), "7")).await.status(), StatusCode::OK);
    assert_eq!(
        h.send(from_user(request(Method::GET, "/"), "8")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn statistics_and_feeds_reflect_denials() {
    let h = Harness::new(TWO_PER_MINUTE);
    for _ in 0..5 {
        h.send(from_ip(request(Method::GET, "/a"), "10.0.0.1")).await;
    }
    for _ in 0..3 {
        h.send(from_ip(request(Method::POST, "/b"), "10.0.0.2")).await;
    }

    let admin = h.gateway.admin();
    let stats = admin.statistics();
    assert_eq!(stats.total_violations, 4);
    assert_eq!(stats.violations_by_endpoint["get:/a"], 3);
    assert_eq!(stats.violations_by_endpoint["post:/b"], 1);
    assert_eq!(stats.top_clients(1), vec![("ip:10.0.0.1".to_string(), 3)]);

    let recent = admin.recent_violations(2);
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].client_id, "ip:10.0.0.2");
    assert!(admin.recent_connections(10).is_empty());
}

#[tokio::test]
async fn reload_swaps_rules_and_keeps_counters() {
    let h = Harness::new(r#"{"general_rules": [{"endpoint": "*", "period": "1m", "limit": 1}]}"#);
    let send = || h.send(from_user(request(Method::GET, "/"), "7"));

    assert_eq!(send().await.status(), StatusCode::OK);
    assert_eq!(send().await.status(), StatusCode::TOO_MANY_REQUESTS);

    let raised = RateLimitConfig {
        general_rules: vec![RuleConfig::new("*", "1m", 3)],
        ..Default::default()
    };
    h.gateway.admin().reload_rules(&raised).unwrap();

    let res = send().await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(header(&res, "x-ratelimit-remaining"), Some("1"));
    assert_eq!(send().await.status(), StatusCode::OK);
    assert_eq!(send().await.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn invalid_reload_keeps_current_rules() {
    let h = Harness::new(TWO_PER_MINUTE);
    let broken = RateLimitConfig {
        general_rules: vec![RuleConfig::new("*", "1w", 3)],
        ..Default::default()
    };
    let err = h.gateway.admin().reload_rules(&broken).unwrap_err();
    assert!(matches!(err, GateError::Config(ConfigError::InvalidPeriod(_))));

    let res = h.send(from_user(request(Method::GET, "/"), "7")).await;
    assert_eq!(header(&res, "x-ratelimit-limit"), Some("2"));
}
