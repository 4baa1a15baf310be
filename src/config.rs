//! Configuration loading and validation.
//!
//! The raw [`RateLimitConfig`] maps directly to the JSON document. It is
//! validated exactly once by [`RateLimitConfig::build_runtime`], which parses
//! every period, pattern, and address up front so nothing is reinterpreted on
//! the request path.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use http::header::HeaderName;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::rules::{EndpointPattern, Period, RateRule, RuleScope, RuleSet, Whitelist};

/// Default budget for a single counter store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Default number of violations kept in the recent feed.
pub const DEFAULT_VIOLATION_CAPACITY: usize = 1_000;

/// Default number of admitted WebSocket upgrades kept in the audit feed.
pub const DEFAULT_CONNECTION_LOG_CAPACITY: usize = 1_000;

/// One `{endpoint, period, limit}` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleConfig {
    /// `*`, a path prefix, or `method:path`. A trailing `*` is accepted.
    pub endpoint: String,
    /// One of `1s`, `1m`, `1h`, `1d`.
    pub period: String,
    pub limit: u64,
}

impl RuleConfig {
    pub fn new(endpoint: impl Into<String>, period: impl Into<String>, limit: u64) -> Self {
        Self { endpoint: endpoint.into(), period: period.into(), limit }
    }

    fn compile(&self, scope: RuleScope) -> Result<RateRule, ConfigError> {
        let period: Period = self.period.parse()?;
        RateRule::new(&self.endpoint, period, self.limit, scope)
    }
}

/// Rules applied to one remote address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpPolicyConfig {
    pub ip: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Rules applied to one client id (`42` means `user:42`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientPolicyConfig {
    pub client_id: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Raw configuration as deserialized from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Rules applied to every HTTP client.
    #[serde(default)]
    pub general_rules: Vec<RuleConfig>,
    #[serde(default)]
    pub ip_policies: Vec<IpPolicyConfig>,
    #[serde(default)]
    pub client_policies: Vec<ClientPolicyConfig>,
    /// Rules checked only for `Upgrade: websocket` requests.
    #[serde(default)]
    pub websocket_rules: Vec<RuleConfig>,
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    /// `method:path`, `*:path`, or bare `path`. Exact unless it ends in `*`.
    #[serde(default)]
    pub endpoint_whitelist: Vec<String>,
    #[serde(default)]
    pub client_whitelist: Vec<String>,
    /// Header consulted for the client address before the socket address,
    /// e.g. `x-forwarded-for`.
    #[serde(default)]
    pub real_ip_header: Option<String>,
    /// Counter store call budget in milliseconds (default: 250).
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,
    /// Recent violation feed capacity (default: 1000).
    #[serde(default)]
    pub violation_capacity: Option<usize>,
    /// Connection audit feed capacity (default: 1000).
    #[serde(default)]
    pub connection_log_capacity: Option<usize>,
    /// Let upgrade requests through the HTTP layer untouched (default: true).
    #[serde(default)]
    pub skip_websocket_upgrades: Option<bool>,
}

/// Validated settings that are not part of the rule table.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub store_timeout: Duration,
    pub violation_capacity: usize,
    pub connection_log_capacity: usize,
    pub real_ip_header: Option<HeaderName>,
    pub skip_websocket_upgrades: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            violation_capacity: DEFAULT_VIOLATION_CAPACITY,
            connection_log_capacity: DEFAULT_CONNECTION_LOG_CAPACITY,
            real_ip_header: None,
            skip_websocket_upgrades: true,
        }
    }
}

/// Output of [`RateLimitConfig::build_runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub rules: RuleSet,
    pub settings: GatewaySettings,
}

impl RateLimitConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let config = Self::from_json_str(&raw)?;
        tracing::info!(
            target: "quotagate::config",
            path = %path.display(),
            general = config.general_rules.len(),
            websocket = config.websocket_rules.len(),
            "loaded rate limit config"
        );
        Ok(config)
    }

    /// Validate the rule tables and whitelists.
    pub fn to_rule_set(&self) -> Result<RuleSet, ConfigError> {
        let general = compile_all(&self.general_rules, || RuleScope::General)?;
        let websocket = compile_all(&self.websocket_rules, || RuleScope::WebSocket)?;

        let ips = self
            .ip_whitelist
            .iter()
            .map(|raw| parse_ip(raw, "ip whitelist"))
            .collect::<Result<Vec<_>, _>>()?;
        let endpoints = self
            .endpoint_whitelist
            .iter()
            .map(|raw| EndpointPattern::whitelist(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let clients = self
            .client_whitelist
            .iter()
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
            .map(str::to_string);

        let mut rules = RuleSet::new(general, websocket, Whitelist::new(ips, endpoints, clients));

        for policy in &self.ip_policies {
            let ip = parse_ip(&policy.ip, "ip policy")?;
            let compiled = compile_all(&policy.rules, || RuleScope::Ip(ip))?;
            rules = rules.with_ip_policy(ip, compiled);
        }
        for policy in &self.client_policies {
            let id = policy.client_id.trim();
            if id.is_empty() {
                return Err(ConfigError::EmptyPattern { context: "client policy id" });
            }
            let key = crate::rules::client_key(id);
            let compiled = compile_all(&policy.rules, || RuleScope::Client(key.clone()))?;
            rules = rules.with_client_policy(id, compiled);
        }

        Ok(rules)
    }

    /// Validate everything and resolve defaults.
    pub fn build_runtime(&self) -> Result<RuntimeConfig, ConfigError> {
        let store_timeout_ms = self
            .store_timeout_ms
            .unwrap_or(DEFAULT_STORE_TIMEOUT.as_millis() as u64);
        let violation_capacity = self.violation_capacity.unwrap_or(DEFAULT_VIOLATION_CAPACITY);
        let connection_log_capacity =
            self.connection_log_capacity.unwrap_or(DEFAULT_CONNECTION_LOG_CAPACITY);

        if store_timeout_ms == 0 {
            return Err(ConfigError::ZeroSetting { field: "store_timeout_ms" });
        }
        if violation_capacity == 0 {
            return Err(ConfigError::ZeroSetting { field: "violation_capacity" });
        }
        if connection_log_capacity == 0 {
            return Err(ConfigError::ZeroSetting { field: "connection_log_capacity" });
        }

        let real_ip_header = self
            .real_ip_header
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| {
                HeaderName::from_bytes(h.as_bytes())
                    .map_err(|_| ConfigError::InvalidHeaderName(h.to_string()))
            })
            .transpose()?;

        Ok(RuntimeConfig {
            rules: self.to_rule_set()?,
            settings: GatewaySettings {
                store_timeout: Duration::from_millis(store_timeout_ms),
                violation_capacity,
                connection_log_capacity,
                real_ip_header,
                skip_websocket_upgrades: self.skip_websocket_upgrades.unwrap_or(true),
            },
        })
    }
}

fn compile_all(
    rules: &[RuleConfig],
    scope: impl Fn() -> RuleScope,
) -> Result<Vec<RateRule>, ConfigError> {
    rules.iter().map(|r| r.compile(scope())).collect()
}

fn parse_ip(raw: &str, context: &'static str) -> Result<IpAddr, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidIp { value: raw.to_string(), context })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ClientIdentity, EndpointKey, ResolvedClient};
    use http::Method;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "general_rules": [
            {"endpoint": "*", "period": "1m", "limit": 100},
            {"endpoint": "post:/api/players/register", "period": "1h", "limit": 5}
        ],
        "ip_policies": [
            {"ip": "10.0.0.7", "rules": [{"endpoint": "*", "period": "1m", "limit": 10}]}
        ],
        "client_policies": [
            {"client_id": "vip", "rules": [{"endpoint": "*", "period": "1m", "limit": 1000}]}
        ],
        "websocket_rules": [{"endpoint": "/gameHub", "period": "1m", "limit": 3}],
        "ip_whitelist": ["127.0.0.1"],
        "endpoint_whitelist": ["get:/health"],
        "client_whitelist": ["admin"],
        "real_ip_header": "X-Forwarded-For",
        "store_timeout_ms": 100
    }"#;

    #[test]
    fn empty_document_uses_defaults() {
        let runtime = RateLimitConfig::from_json_str("{}").unwrap().build_runtime().unwrap();
        assert!(runtime.rules.is_empty());
        assert_eq!(runtime.settings.store_timeout, DEFAULT_STORE_TIMEOUT);
        assert_eq!(runtime.settings.violation_capacity, DEFAULT_VIOLATION_CAPACITY);
        assert!(runtime.settings.skip_websocket_upgrades);
        assert!(runtime.settings.real_ip_header.is_none());
    }

    #[test]
    fn sample_document_compiles_every_section() {
        let runtime = RateLimitConfig::from_json_str(SAMPLE).unwrap().build_runtime().unwrap();
        let rules = &runtime.rules;

        let register = EndpointKey::new(&Method::POST, "/api/players/register");
        let anon = ResolvedClient {
            identity: ClientIdentity::ip("8.8.8.8".parse().unwrap()),
            ip: Some("8.8.8.8".parse().unwrap()),
        };
        let descriptors: Vec<_> =
            rules.resolve_http(&anon, &register).iter().map(RateRule::descriptor).collect();
        assert_eq!(descriptors, vec!["5/1h", "100/1m"]);

        let throttled = ResolvedClient {
            identity: ClientIdentity::ip("10.0.0.7".parse().unwrap()),
            ip: Some("10.0.0.7".parse().unwrap()),
        };
        let get_root = EndpointKey::new(&Method::GET, "/");
        assert_eq!(rules.resolve_http(&throttled, &get_root)[0].limit, 10);

        let vip = ResolvedClient { identity: ClientIdentity::user("vip"), ip: None };
        assert_eq!(rules.resolve_http(&vip, &get_root)[0].limit, 1000);

        assert!(rules.whitelist().allows_endpoint(&EndpointKey::new(&Method::GET, "/health")));
        assert!(rules.whitelist().allows_ip("127.0.0.1".parse().unwrap()));
        assert!(rules.whitelist().allows_client(&ClientIdentity::user("admin")));

        assert_eq!(runtime.settings.store_timeout, Duration::from_millis(100));
        assert_eq!(
            runtime.settings.real_ip_header,
            Some(HeaderName::from_static("x-forwarded-for"))
        );
    }

    #[test]
    fn unknown_period_is_fatal() {
        let raw = r#"{"general_rules":[{"endpoint":"*","period":"5m","limit":1}]}"#;
        let err = RateLimitConfig::from_json_str(raw).unwrap().build_runtime().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPeriod(p) if p == "5m"));
    }

    #[test]
    fn missing_limit_is_a_parse_error() {
        let raw = r#"{"general_rules":[{"endpoint":"*","period":"1m"}]}"#;
        assert!(matches!(RateLimitConfig::from_json_str(raw), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn bad_whitelist_ip_is_fatal() {
        let config = RateLimitConfig { ip_whitelist: vec!["nope".into()], ..Default::default() };
        assert!(matches!(
            config.to_rule_set(),
            Err(ConfigError::InvalidIp { context: "ip whitelist", .. })
        ));
    }

    #[test]
    fn zero_settings_are_rejected() {
        let config = RateLimitConfig { violation_capacity: Some(0), ..Default::default() };
        assert!(matches!(
            config.build_runtime(),
            Err(ConfigError::ZeroSetting { field: "violation_capacity" })
        ));
    }

    #[test]
    fn invalid_real_ip_header_is_rejected() {
        let config =
            RateLimitConfig { real_ip_header: Some("bad header".into()), ..Default::default() };
        assert!(matches!(config.build_runtime(), Err(ConfigError::InvalidHeaderName(_))));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = RateLimitConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.general_rules.len(), 2);
        assert_eq!(config.websocket_rules[0], RuleConfig::new("/gameHub", "1m", 3));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = RateLimitConfig::load_from_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
