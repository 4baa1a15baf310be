use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::header::UPGRADE;
use http::{Request, Response};
use tower_layer::Layer;
use tower_service::Service;

use super::{websocket_rejected, Enforcer};
use crate::admission::Decision;
use crate::rules::RuleScope;
use crate::store::Namespace;

/// True when the `Upgrade` header mentions `websocket` (any case).
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get_all(UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("websocket"))
}

/// A layer that enforces WebSocket upgrade quotas.
///
/// Only requests carrying `Upgrade: websocket` are checked, against the
/// WebSocket rule table and a counter namespace of their own. Other requests
/// pass through. Rejected upgrades get a plain-text 429 before any handshake;
/// admitted ones are recorded in the connection audit feed.
#[derive(Clone, Debug)]
pub struct WebSocketRateLimitLayer {
    enforcer: Arc<Enforcer>,
}

impl WebSocketRateLimitLayer {
    pub fn new(enforcer: Enforcer) -> Self {
        Self { enforcer: Arc::new(enforcer) }
    }

    pub(crate) fn shared(enforcer: Arc<Enforcer>) -> Self {
        Self { enforcer }
    }
}

impl<S> Layer<S> for WebSocketRateLimitLayer {
    type Service = WebSocketRateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        WebSocketRateLimitService { inner: service, enforcer: self.enforcer.clone() }
    }
}

/// Middleware service produced by [`WebSocketRateLimitLayer`].
#[derive(Clone, Debug)]
pub struct WebSocketRateLimitService<S> {
    inner: S,
    enforcer: Arc<Enforcer>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for WebSocketRateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !is_websocket_upgrade(&req) {
            return Box::pin(inner.call(req));
        }
        let enforcer = self.enforcer.clone();

        Box::pin(async move {
            let prepared = enforcer.prepare(&req);
            let client = &prepared.client.identity;
            if prepared.whitelisted {
                enforcer.monitor.record_connection(client, &prepared.endpoint);
                return inner.call(req).await;
            }

            let rules = prepared.rules.rules_for(&RuleScope::WebSocket, &prepared.endpoint);
            let decision = enforcer
                .engine
                .evaluate(client, &prepared.endpoint, &rules, Namespace::WebSocket)
                .await;

            match decision {
                Decision::Denied { rule, .. } => {
                    enforcer.monitor.log_violation(client, &prepared.endpoint, &rule.descriptor());
                    Ok(websocket_rejected(&rule))
                }
                Decision::Allowed { store_error, .. } => {
                    if store_error.is_some() {
                        enforcer.monitor.record_store_failure();
                    }
                    enforcer.monitor.record_connection(client, &prepared.endpoint);
                    inner.call(req).await
                }
            }
        })
    }
}
