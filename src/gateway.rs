//! Wiring: one rule repository, engine, and monitor shared by both layers and
//! the admin facade.

use std::sync::Arc;

use crate::admin::RateLimitAdmin;
use crate::admission::AdmissionEngine;
use crate::clock::{Clock, SystemClock};
use crate::config::{GatewaySettings, RateLimitConfig};
use crate::error::ConfigError;
use crate::identity::ClientResolver;
use crate::middleware::{Enforcer, RateLimitLayer, WebSocketRateLimitLayer};
use crate::monitor::ViolationMonitor;
use crate::rules::{RuleRepository, RuleSet};
use crate::store::CounterStore;

/// Entry point for embedding admission control in a tower stack.
///
/// ```ignore
/// let gateway = RateLimitGateway::from_config(&config, Arc::new(InMemoryCounterStore::new()))?;
/// let svc = ServiceBuilder::new()
///     .layer(gateway.websocket_layer())
///     .layer(gateway.http_layer())
///     .service(app);
/// ```
#[derive(Clone, Debug)]
pub struct RateLimitGateway {
    enforcer: Arc<Enforcer>,
    settings: GatewaySettings,
}

impl RateLimitGateway {
    pub fn new(rules: RuleSet, store: Arc<dyn CounterStore>, settings: GatewaySettings) -> Self {
        Self::with_clock(rules, store, settings, Arc::new(SystemClock))
    }

    /// Same as [`new`](Self::new) with every window and timestamp taken from
    /// `clock`.
    pub fn with_clock(
        rules: RuleSet,
        store: Arc<dyn CounterStore>,
        settings: GatewaySettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let engine = AdmissionEngine::new(store, clock.clone(), settings.store_timeout);
        let monitor = ViolationMonitor::with_clock(
            settings.violation_capacity,
            settings.connection_log_capacity,
            clock,
        );
        let enforcer = Enforcer::new(RuleRepository::new(rules), engine, monitor)
            .with_resolver(ClientResolver::new(settings.real_ip_header.clone()));
        Self { enforcer: Arc::new(enforcer), settings }
    }

    pub fn from_config(
        config: &RateLimitConfig,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self, ConfigError> {
        let runtime = config.build_runtime()?;
        Ok(Self::new(runtime.rules, store, runtime.settings))
    }

    pub fn http_layer(&self) -> RateLimitLayer {
        RateLimitLayer::shared(self.enforcer.clone(), self.settings.skip_websocket_upgrades)
    }

    pub fn websocket_layer(&self) -> WebSocketRateLimitLayer {
        WebSocketRateLimitLayer::shared(self.enforcer.clone())
    }

    pub fn admin(&self) -> RateLimitAdmin {
        RateLimitAdmin::new(
            self.enforcer.rules.clone(),
            self.enforcer.engine.clone(),
            self.enforcer.monitor.clone(),
        )
    }

    pub fn rules(&self) -> &RuleRepository {
        &self.enforcer.rules
    }

    pub fn monitor(&self) -> &ViolationMonitor {
        &self.enforcer.monitor
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }
}
