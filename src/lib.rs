#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotagate
//!
//! Request admission control for API gateways: fixed-window quotas shared
//! across gateway instances, enforced as tower middleware.
//!
//! ## Features
//!
//! - **Rule tables** for general, per-IP, per-client and WebSocket quotas with
//!   `1s`/`1m`/`1h`/`1d` windows
//! - **Segment-aware endpoint patterns** with optional method prefixes
//! - **Atomic counter stores**: in-process, or Redis via `quotagate-redis`
//! - **HTTP and WebSocket-upgrade layers** answering 429 with `Retry-After`
//! - **Violation monitor** with bounded feeds and aggregates
//! - **Hot reload** of rules without locking the request path
//!
//! Store failures fail open: the request is forwarded without quota headers
//! and counted in [`Statistics::store_failures`].
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use http::{Request, Response};
//! use quotagate::{InMemoryCounterStore, RateLimitConfig, RateLimitGateway};
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RateLimitConfig::from_json_str(r#"{
//!     "general_rules": [{"endpoint": "*", "period": "1m", "limit": 100}],
//!     "endpoint_whitelist": ["get:/health"]
//! }"#)?;
//! let gateway = RateLimitGateway::from_config(&config, Arc::new(InMemoryCounterStore::new()))?;
//!
//! let app = service_fn(|_req: Request<String>| async {
//!     Ok::<_, std::convert::Infallible>(Response::new(String::from("ok")))
//! });
//! let svc = ServiceBuilder::new()
//!     .layer(gateway.websocket_layer())
//!     .layer(gateway.http_layer())
//!     .service(app);
//!
//! let res = svc.oneshot(Request::new(String::new())).await?;
//! assert_eq!(res.headers()["x-ratelimit-remaining"], "99");
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod middleware;
pub mod monitor;
pub mod rules;
pub mod store;

// Re-exports
pub use admin::RateLimitAdmin;
pub use admission::{AdmissionEngine, Decision, Quota, RateLimitInfo};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GatewaySettings, RateLimitConfig, RuleConfig, RuntimeConfig};
pub use error::{ConfigError, GateError, StoreError};
pub use gateway::RateLimitGateway;
pub use identity::{AuthenticatedSubject, ClientAddr, ClientIdentity, ClientResolver, EndpointKey};
pub use middleware::{
    Enforcer, RateLimitLayer, RateLimitService, WebSocketRateLimitLayer, WebSocketRateLimitService,
};
pub use monitor::{
    ConnectionAttempt, Statistics, Violation, ViolationMonitor, DEFAULT_BREAKDOWN_CAPACITY,
    OVERFLOW_BUCKET,
};
pub use rules::{EndpointPattern, Period, RateRule, RuleRepository, RuleScope, RuleSet, Whitelist};
pub use store::{
    CheckOutcome, CounterKey, CounterRecord, CounterStore, InMemoryCounterStore, Namespace,
};
