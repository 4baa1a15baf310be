//! Rule repository: rate rules per scope, endpoint matching, precedence, and
//! whitelists.
//!
//! The [`RuleSet`] is immutable once built. [`RuleRepository`] hands out
//! snapshots and swaps the whole table on reload so readers never observe a
//! partially updated set.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::ConfigError;
use crate::identity::{normalize_path, ClientIdentity, EndpointKey, ResolvedClient};

/// Supported fixed-window lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    Second,
    Minute,
    Hour,
    Day,
}

impl Period {
    /// Window length in seconds. Also the `Retry-After` value sent on denial.
    pub fn as_secs(self) -> u64 {
        match self {
            Period::Second => 1,
            Period::Minute => 60,
            Period::Hour => 3_600,
            Period::Day => 86_400,
        }
    }

    pub fn as_millis(self) -> u64 {
        self.as_secs() * 1_000
    }

    pub fn retry_after_secs(self) -> u64 {
        self.as_secs()
    }

    /// Config spelling of the period (`1s`, `1m`, `1h`, `1d`).
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Second => "1s",
            Period::Minute => "1m",
            Period::Hour => "1h",
            Period::Day => "1d",
        }
    }
}

impl FromStr for Period {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1s" => Ok(Period::Second),
            "1m" => Ok(Period::Minute),
            "1h" => Ok(Period::Hour),
            "1d" => Ok(Period::Day),
            _ => Err(ConfigError::InvalidPeriod(s.to_string())),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which table a rule was loaded into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleScope {
    /// Applies to every HTTP client.
    General,
    /// Policy for a single remote address.
    Ip(IpAddr),
    /// Policy for a single client identity (`user:<id>`, `ip:<addr>`).
    Client(String),
    /// Applies to WebSocket upgrade requests only.
    WebSocket,
}

/// An endpoint pattern such as `*`, `/api/players`, `post:/api/game/*`.
///
/// Rule patterns match on path-segment boundaries: `/api/players` matches
/// `/api/players` and `/api/players/42` but not `/api/playersomething`.
/// A trailing `*` is accepted and stripped. A `method:` prefix restricts the
/// match to that method; `*:` or no prefix matches any method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPattern {
    raw: String,
    method: Option<String>,
    path: Option<String>,
    prefix: bool,
}

impl EndpointPattern {
    /// Pattern for a rate rule (segment-prefix matching).
    pub fn rule(raw: &str) -> Result<Self, ConfigError> {
        Self::parse(raw, true, "rate rule")
    }

    /// Pattern for a whitelist entry: exact path unless it ends in `*`.
    pub fn whitelist(raw: &str) -> Result<Self, ConfigError> {
        Self::parse(raw, false, "endpoint whitelist")
    }

    fn parse(raw: &str, prefix: bool, context: &'static str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::EmptyPattern { context });
        }

        let (method, path_part) = match trimmed.split_once(':') {
            Some((method, path)) => (Some(method.trim()), path.trim()),
            None => (None, trimmed),
        };
        let method = method.filter(|m| !m.is_empty() && *m != "*").map(str::to_ascii_lowercase);

        let has_marker = path_part.ends_with('*');
        let stripped = path_part.trim_end_matches('*');
        let path = if stripped.is_empty() { None } else { Some(normalize_path(stripped)) };

        Ok(Self { raw: trimmed.to_string(), method, path, prefix: prefix || has_marker })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True for the catch-all `*` pattern.
    pub fn is_wildcard(&self) -> bool {
        self.method.is_none() && self.path.is_none()
    }

    /// Ordering key for overlapping patterns: more path segments first, then
    /// a method-qualified pattern over a bare one.
    pub fn specificity(&self) -> (usize, bool) {
        let segments = self
            .path
            .as_deref()
            .map_or(0, |path| path.split('/').filter(|s| !s.is_empty()).count());
        (segments, self.method.is_some())
    }

    pub fn matches(&self, endpoint: &EndpointKey) -> bool {
        if let Some(method) = &self.method {
            if method != endpoint.method() {
                return false;
            }
        }
        let Some(pattern) = &self.path else {
            return true;
        };
        if !self.prefix {
            return pattern == endpoint.path();
        }
        if pattern == "/" {
            return true;
        }
        endpoint
            .path()
            .strip_prefix(pattern.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}

impl fmt::Display for EndpointPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A single quota: at most `limit` requests per `period` on matching endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRule {
    pub pattern: EndpointPattern,
    pub period: Period,
    pub limit: u64,
    pub scope: RuleScope,
}

impl RateRule {
    pub fn new(
        endpoint: &str,
        period: Period,
        limit: u64,
        scope: RuleScope,
    ) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::ZeroLimit { endpoint: endpoint.to_string() });
        }
        Ok(Self { pattern: EndpointPattern::rule(endpoint)?, period, limit, scope })
    }

    /// `<limit>/<period>`, e.g. `5/1h`.
    pub fn descriptor(&self) -> String {
        format!("{}/{}", self.limit, self.period)
    }

    fn same_slot(&self, other: &RateRule) -> bool {
        self.period == other.period && self.pattern.as_str() == other.pattern.as_str()
    }
}

/// Requests that bypass rule lookup entirely.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    ips: HashSet<IpAddr>,
    endpoints: Vec<EndpointPattern>,
    clients: HashSet<String>,
}

impl Whitelist {
    pub fn new(
        ips: impl IntoIterator<Item = IpAddr>,
        endpoints: Vec<EndpointPattern>,
        clients: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            ips: ips.into_iter().collect(),
            endpoints,
            clients: clients.into_iter().map(|c| client_key(&c)).collect(),
        }
    }

    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        self.ips.contains(&ip)
    }

    pub fn allows_endpoint(&self, endpoint: &EndpointKey) -> bool {
        self.endpoints.iter().any(|p| p.matches(endpoint))
    }

    pub fn allows_client(&self, client: &ClientIdentity) -> bool {
        self.clients.contains(client.as_str())
    }

    /// Whitelisted by address or identity.
    pub fn allows(&self, client: &ResolvedClient) -> bool {
        client.ip.is_some_and(|ip| self.allows_ip(ip)) || self.allows_client(&client.identity)
    }
}

/// Bare ids in config mean authenticated subjects.
pub(crate) fn client_key(raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains(':') || raw == ClientIdentity::UNKNOWN {
        raw.to_string()
    } else {
        ClientIdentity::user(raw).as_str().to_string()
    }
}

/// Immutable rule table for every scope plus the whitelists.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    general: Vec<RateRule>,
    ip_policies: HashMap<IpAddr, Vec<RateRule>>,
    client_policies: HashMap<String, Vec<RateRule>>,
    websocket: Vec<RateRule>,
    whitelist: Whitelist,
}

impl RuleSet {
    pub fn new(general: Vec<RateRule>, websocket: Vec<RateRule>, whitelist: Whitelist) -> Self {
        Self { general, websocket, whitelist, ..Default::default() }
    }

    pub fn with_ip_policy(mut self, ip: IpAddr, rules: Vec<RateRule>) -> Self {
        self.ip_policies.entry(ip).or_default().extend(rules);
        self
    }

    pub fn with_client_policy(mut self, client: &str, rules: Vec<RateRule>) -> Self {
        self.client_policies.entry(client_key(client)).or_default().extend(rules);
        self
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Rules of one scope that apply to `endpoint`, in precedence order.
    pub fn rules_for(&self, scope: &RuleScope, endpoint: &EndpointKey) -> Vec<RateRule> {
        let table: &[RateRule] = match scope {
            RuleScope::General => &self.general,
            RuleScope::WebSocket => &self.websocket,
            RuleScope::Ip(ip) => self.ip_policies.get(ip).map(Vec::as_slice).unwrap_or(&[]),
            RuleScope::Client(id) => {
                self.client_policies.get(id.as_str()).map(Vec::as_slice).unwrap_or(&[])
            }
        };
        order_by_precedence(table.iter().filter(|r| r.pattern.matches(endpoint)).cloned().collect())
    }

    /// Effective HTTP rules for a client: client and IP policies first, then
    /// general rules not overridden by a policy rule with the same pattern and
    /// period.
    pub fn resolve_http(&self, client: &ResolvedClient, endpoint: &EndpointKey) -> Vec<RateRule> {
        let mut candidates: Vec<RateRule> = Vec::new();
        let mut push_matching = |rules: &[RateRule]| {
            for rule in rules.iter().filter(|r| r.pattern.matches(endpoint)) {
                if !candidates.iter().any(|c| c.same_slot(rule)) {
                    candidates.push(rule.clone());
                }
            }
        };

        if let Some(rules) = self.client_policies.get(client.identity.as_str()) {
            push_matching(rules);
        }
        if let Some(rules) = client.ip.and_then(|ip| self.ip_policies.get(&ip)) {
            push_matching(rules);
        }
        push_matching(&self.general);

        order_by_precedence(candidates)
    }

    pub fn is_empty(&self) -> bool {
        self.general.is_empty()
            && self.websocket.is_empty()
            && self.ip_policies.is_empty()
            && self.client_policies.is_empty()
    }
}

/// Specific rules first, one per period, then wildcard rules for the periods
/// no specific rule covers.
///
/// Within a period the narrowest pattern wins, so `/api/game/click` at 1000/1m
/// overrides `/api` at 50/1m on the click endpoint. Patterns of equal
/// specificity fall back to the smaller limit.
fn order_by_precedence(matching: Vec<RateRule>) -> Vec<RateRule> {
    fn narrowest(rules: impl Iterator<Item = RateRule>) -> BTreeMap<Period, RateRule> {
        let mut by_period: BTreeMap<Period, RateRule> = BTreeMap::new();
        for rule in rules {
            let replaces = match by_period.get(&rule.period) {
                Some(existing) => {
                    let (ours, theirs) =
                        (rule.pattern.specificity(), existing.pattern.specificity());
                    ours > theirs || (ours == theirs && rule.limit < existing.limit)
                }
                None => true,
            };
            if replaces {
                by_period.insert(rule.period, rule);
            }
        }
        by_period
    }

    let (wildcard, specific): (Vec<_>, Vec<_>) =
        matching.into_iter().partition(|r| r.pattern.is_wildcard());

    let specific = narrowest(specific.into_iter());
    let wildcard = narrowest(wildcard.into_iter().filter(|r| !specific.contains_key(&r.period)));

    specific.into_values().chain(wildcard.into_values()).collect()
}

/// Shared handle to the current [`RuleSet`].
///
/// Clones share the same table. Reads are lock-free snapshots; [`reload`]
/// replaces the whole set atomically.
///
/// [`reload`]: RuleRepository::reload
#[derive(Debug, Clone)]
pub struct RuleRepository {
    current: Arc<ArcSwap<RuleSet>>,
}

impl RuleRepository {
    pub fn new(rules: RuleSet) -> Self {
        Self { current: Arc::new(ArcSwap::from_pointee(rules)) }
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    pub fn reload(&self, rules: RuleSet) {
        self.current.store(Arc::new(rules));
        tracing::info!(target: "quotagate::rules", "rate limit rules reloaded");
    }

    pub fn rules_for(&self, scope: &RuleScope, endpoint: &EndpointKey) -> Vec<RateRule> {
        self.current.load().rules_for(scope, endpoint)
    }
}

impl Default for RuleRepository {
    fn default() -> Self {
        Self::new(RuleSet::default())
    }
}
