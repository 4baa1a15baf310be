//! Administrative facade for an external controller layer.

use http::Method;

use crate::admission::{AdmissionEngine, RateLimitInfo};
use crate::config::RateLimitConfig;
use crate::error::GateError;
use crate::identity::{ClientIdentity, EndpointKey, ResolvedClient};
use crate::monitor::{ConnectionAttempt, Statistics, Violation, ViolationMonitor};
use crate::rules::{client_key, RuleRepository};
use crate::store::Namespace;

/// Query and reset quotas, read monitor feeds, and reload rules.
///
/// Client ids are full identities (`user:42`, `ip:10.0.0.1`); a bare id is
/// read as `user:<id>`. Endpoints are `method:path`; a bare path means `GET`.
#[derive(Clone, Debug)]
pub struct RateLimitAdmin {
    rules: RuleRepository,
    engine: AdmissionEngine,
    monitor: ViolationMonitor,
}

impl RateLimitAdmin {
    pub fn new(rules: RuleRepository, engine: AdmissionEngine, monitor: ViolationMonitor) -> Self {
        Self { rules, engine, monitor }
    }

    /// Binding quota of `client_id` on `endpoint` without counting a request.
    /// `None` when no HTTP rule applies.
    pub async fn get_info(
        &self,
        client_id: &str,
        endpoint: &str,
    ) -> Result<Option<RateLimitInfo>, GateError> {
        let client = resolved(client_id);
        let endpoint = parse_endpoint(endpoint);
        let rules = self.rules.snapshot().resolve_http(&client, &endpoint);
        Ok(self.engine.get_info(&client.identity, &endpoint, &rules, Namespace::Http).await?)
    }

    /// Drop every HTTP and WebSocket counter of `client_id`.
    pub async fn reset_client_limits(&self, client_id: &str) -> Result<usize, GateError> {
        Ok(self.engine.reset(&resolved(client_id).identity).await?)
    }

    pub fn statistics(&self) -> Statistics {
        self.monitor.statistics()
    }

    pub fn recent_violations(&self, count: usize) -> Vec<Violation> {
        self.monitor.recent_violations(count)
    }

    pub fn recent_connections(&self, count: usize) -> Vec<ConnectionAttempt> {
        self.monitor.recent_connections(count)
    }

    /// Validate `config` and swap in its rule tables and whitelists.
    ///
    /// Settings such as timeouts and feed capacities are fixed at startup and
    /// are not affected.
    pub fn reload_rules(&self, config: &RateLimitConfig) -> Result<(), GateError> {
        let rules = config.to_rule_set()?;
        self.rules.reload(rules);
        Ok(())
    }
}

fn resolved(client_id: &str) -> ResolvedClient {
    let identity = ClientIdentity::from_raw(client_key(client_id));
    let ip = identity.ip_addr();
    ResolvedClient { identity, ip }
}

fn parse_endpoint(raw: &str) -> EndpointKey {
    EndpointKey::parse(raw).unwrap_or_else(|| EndpointKey::new(&Method::GET, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ids_and_paths_get_defaults() {
        assert_eq!(resolved("42").identity.as_str(), "user:42");
        let by_ip = resolved("ip:10.0.0.1");
        assert_eq!(by_ip.ip, Some("10.0.0.1".parse().unwrap()));

        assert_eq!(parse_endpoint("/api/players").to_string(), "get:/api/players");
        assert_eq!(parse_endpoint("POST:/api/players").to_string(), "post:/api/players");
    }
}
