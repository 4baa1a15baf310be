//! Error types for configuration loading, counter stores, and the admin surface.
//!
//! A denial is not an error: it travels as [`Decision::Denied`](crate::Decision)
//! and becomes a 429 response. Errors here are either fatal at startup
//! ([`ConfigError`]) or recovered locally by failing open ([`StoreError`]).
use std::time::Duration;

use thiserror::Error;

/// Problems found while loading or validating rate limit configuration.
///
/// Every variant is fatal: the gateway should refuse to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Period string is not one of the supported windows.
    #[error("unsupported rate limit period '{0}' (expected one of 1s, 1m, 1h, 1d)")]
    InvalidPeriod(String),
    /// A rule declared a limit of zero.
    #[error("rule for endpoint '{endpoint}' has limit 0; limits must be positive")]
    ZeroLimit {
        /// Endpoint pattern of the offending rule.
        endpoint: String,
    },
    /// A rule or whitelist entry had an empty pattern.
    #[error("empty endpoint pattern in {context}")]
    EmptyPattern {
        /// Where the empty pattern was found.
        context: &'static str,
    },
    /// An IP whitelist or IP policy entry was not a valid address.
    #[error("invalid IP address '{value}' in {context}")]
    InvalidIp {
        /// The rejected value.
        value: String,
        /// Where it was found.
        context: &'static str,
    },
    /// The configured real-IP header is not a valid header name.
    #[error("invalid real_ip_header '{0}'")]
    InvalidHeaderName(String),
    /// A size or timeout setting was zero.
    #[error("{field} must be greater than zero")]
    ZeroSetting {
        /// Name of the offending field.
        field: &'static str,
    },
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration document is not valid JSON for the schema.
    #[error("failed to parse rate limit config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failures talking to a counter store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer within the configured budget.
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),
    /// The store answered with something unexpected.
    #[error("counter store backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the administrative facade.
#[derive(Debug, Error)]
pub enum GateError {
    /// Counter store failure during an administrative call.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Configuration failure during reload.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_period_message_lists_supported_values() {
        let msg = ConfigError::InvalidPeriod("5x".into()).to_string();
        assert!(msg.contains("5x"));
        assert!(msg.contains("1s, 1m, 1h, 1d"));
    }

    #[test]
    fn zero_limit_names_endpoint() {
        let msg = ConfigError::ZeroLimit { endpoint: "/api/x".into() }.to_string();
        assert!(msg.contains("/api/x"));
    }

    #[test]
    fn store_timeout_display_includes_duration() {
        let msg = StoreError::Timeout(Duration::from_millis(250)).to_string();
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn gate_error_is_transparent_over_store_error() {
        let err: GateError = StoreError::Unavailable("connection refused".into()).into();
        assert_eq!(err.to_string(), "counter store unavailable: connection refused");
    }
}
