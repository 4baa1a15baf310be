//! Client identity and endpoint key derivation.
//!
//! The identity is the quota partition key: `user:<id>` for authenticated
//! callers, `ip:<addr>` otherwise, and the shared `unknown` bucket when neither
//! is available. The endpoint key is the lowercased `method:path` pair used
//! both for rule matching and for counter partitioning.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use http::header::HeaderName;
use http::{Method, Request};

/// Request extension carrying the subject id established by upstream auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSubject(pub String);

/// Request extension carrying the peer socket address of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Quota partition key for one logical client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Sentinel shared by every request with neither a subject nor an address.
    pub const UNKNOWN: &'static str = "unknown";

    pub fn user(id: impl AsRef<str>) -> Self {
        Self(format!("user:{}", id.as_ref()))
    }

    pub fn ip(addr: IpAddr) -> Self {
        Self(format!("ip:{addr}"))
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    /// Wrap an already-formatted identity such as `user:42` or `ip:10.0.0.1`.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address embedded in an `ip:` identity.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.0.strip_prefix("ip:").and_then(|s| s.parse().ok())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized `method:path` key for a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    method: String,
    path: String,
}

impl EndpointKey {
    pub fn new(method: &Method, path: &str) -> Self {
        Self { method: method.as_str().to_ascii_lowercase(), path: normalize_path(path) }
    }

    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self::new(req.method(), req.uri().path())
    }

    /// Parse `get:/api/players`. Returns `None` without a method prefix.
    pub fn parse(raw: &str) -> Option<Self> {
        let (method, path) = raw.trim().split_once(':')?;
        let method = method.trim();
        if method.is_empty() || method == "*" {
            return None;
        }
        Some(Self { method: method.to_ascii_lowercase(), path: normalize_path(path) })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.method, self.path)
    }
}

/// Lowercase, drop the query string, and strip trailing slashes (root stays `/`).
pub(crate) fn normalize_path(path: &str) -> String {
    let path = path.split('?').next().unwrap_or_default().trim();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    let lowered = trimmed.to_ascii_lowercase();
    if lowered.starts_with('/') {
        lowered
    } else {
        format!("/{lowered}")
    }
}

/// Identity plus the address it was derived from, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClient {
    pub identity: ClientIdentity,
    pub ip: Option<IpAddr>,
}

/// Derives [`ResolvedClient`] values from requests.
///
/// The subject comes from an [`AuthenticatedSubject`] extension. The address
/// comes from the configured real-IP header when present, then from the
/// [`ClientAddr`] extension.
#[derive(Debug, Clone, Default)]
pub struct ClientResolver {
    real_ip_header: Option<HeaderName>,
}

impl ClientResolver {
    pub fn new(real_ip_header: Option<HeaderName>) -> Self {
        Self { real_ip_header }
    }

    pub fn resolve<B>(&self, req: &Request<B>) -> ResolvedClient {
        let ip = self.remote_ip(req);
        let subject = req
            .extensions()
            .get::<AuthenticatedSubject>()
            .map(|s| s.0.trim())
            .filter(|s| !s.is_empty());

        let identity = match (subject, ip) {
            (Some(subject), _) => ClientIdentity::user(subject),
            (None, Some(ip)) => ClientIdentity::ip(ip),
            (None, None) => ClientIdentity::unknown(),
        };
        ResolvedClient { identity, ip }
    }

    fn remote_ip<B>(&self, req: &Request<B>) -> Option<IpAddr> {
        let from_header = self.real_ip_header.as_ref().and_then(|name| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|first| first.trim().parse::<IpAddr>().ok())
        });
        from_header.or_else(|| req.extensions().get::<ClientAddr>().map(|addr| addr.0.ip()))
    }
}
