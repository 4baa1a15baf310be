//! Tower middleware enforcing quotas on HTTP requests and WebSocket upgrades.
//!
//! Both layers share one [`Enforcer`]: rule repository, admission engine,
//! violation monitor, and client resolver. Stack the WebSocket layer outside
//! the HTTP layer so upgrades are checked against their own rules.

pub mod request;
pub mod websocket;

use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Request, Response, StatusCode};

use crate::admission::{AdmissionEngine, RateLimitInfo};
use crate::identity::{ClientResolver, EndpointKey, ResolvedClient};
use crate::monitor::ViolationMonitor;
use crate::rules::{RateRule, RuleRepository, RuleSet};

pub use request::{RateLimitLayer, RateLimitService};
pub use websocket::{is_websocket_upgrade, WebSocketRateLimitLayer, WebSocketRateLimitService};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Body `error` field of every HTTP denial.
pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";

/// Plain-text body of a rejected WebSocket upgrade.
pub const WEBSOCKET_REJECTION: &str = "WebSocket connection rate limit exceeded";

/// State shared by the HTTP and WebSocket layers.
#[derive(Clone, Debug)]
pub struct Enforcer {
    pub(crate) rules: RuleRepository,
    pub(crate) engine: AdmissionEngine,
    pub(crate) monitor: ViolationMonitor,
    pub(crate) resolver: ClientResolver,
}

impl Enforcer {
    pub fn new(rules: RuleRepository, engine: AdmissionEngine, monitor: ViolationMonitor) -> Self {
        Self { rules, engine, monitor, resolver: ClientResolver::default() }
    }

    pub fn with_resolver(mut self, resolver: ClientResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Client, endpoint, rule snapshot, and whether the whitelist lets the
    /// request through untouched.
    fn prepare<B>(&self, req: &Request<B>) -> Prepared {
        let endpoint = EndpointKey::from_request(req);
        let client = self.resolver.resolve(req);
        let rules = self.rules.snapshot();
        let whitelisted =
            rules.whitelist().allows_endpoint(&endpoint) || rules.whitelist().allows(&client);
        Prepared { endpoint, client, rules, whitelisted }
    }
}

struct Prepared {
    endpoint: EndpointKey,
    client: ResolvedClient,
    rules: std::sync::Arc<RuleSet>,
    whitelisted: bool,
}

/// 429 with `Retry-After` and the JSON denial body.
pub fn too_many_requests<B: From<String>>(rule: &RateRule) -> Response<B> {
    let retry_after = rule.period.retry_after_secs();
    let body = serde_json::json!({
        "error": RATE_LIMIT_EXCEEDED,
        "message": format!("Too many requests. Limit: {} per {}", rule.limit, rule.period),
        "retryAfter": retry_after,
    });
    rejection(body.to_string(), "application/json", retry_after)
}

/// 429 with `Retry-After` and the plain-text upgrade rejection body.
pub fn websocket_rejected<B: From<String>>(rule: &RateRule) -> Response<B> {
    rejection(
        WEBSOCKET_REJECTION.to_string(),
        "text/plain; charset=utf-8",
        rule.period.retry_after_secs(),
    )
}

fn rejection<B: From<String>>(
    body: String,
    content_type: &'static str,
    retry_after: u64,
) -> Response<B> {
    let mut response = Response::new(B::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// `X-RateLimit-*` headers for the binding quota.
pub fn apply_quota_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(info.remaining()));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(info.reset_unix_secs()));
}
