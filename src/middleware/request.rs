use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Request, Response};
use tower_layer::Layer;
use tower_service::Service;

use super::{apply_quota_headers, is_websocket_upgrade, too_many_requests, Enforcer};
use crate::admission::Decision;
use crate::store::Namespace;

/// A layer that enforces HTTP quotas.
///
/// Denied requests get a 429 JSON response and never reach the inner service.
/// Admitted requests carry the binding [`RateLimitInfo`] as a request
/// extension and get `X-RateLimit-*` headers on the way out.
///
/// [`RateLimitInfo`]: crate::RateLimitInfo
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    enforcer: Arc<Enforcer>,
    skip_websocket_upgrades: bool,
}

impl RateLimitLayer {
    pub fn new(enforcer: Enforcer) -> Self {
        Self { enforcer: Arc::new(enforcer), skip_websocket_upgrades: true }
    }

    pub(crate) fn shared(enforcer: Arc<Enforcer>, skip_websocket_upgrades: bool) -> Self {
        Self { enforcer, skip_websocket_upgrades }
    }

    /// When set (the default), upgrade requests pass through untouched and are
    /// left to [`WebSocketRateLimitLayer`](super::WebSocketRateLimitLayer).
    pub fn skip_websocket_upgrades(mut self, skip: bool) -> Self {
        self.skip_websocket_upgrades = skip;
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            enforcer: self.enforcer.clone(),
            skip_websocket_upgrades: self.skip_websocket_upgrades,
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    enforcer: Arc<Enforcer>,
    skip_websocket_upgrades: bool,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S>
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

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the one poll_ready was called on.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let enforcer = self.enforcer.clone();

        if self.skip_websocket_upgrades && is_websocket_upgrade(&req) {
            return Box::pin(inner.call(req));
        }

        Box::pin(async move {
            let prepared = enforcer.prepare(&req);
            if prepared.whitelisted {
                tracing::trace!(
                    target: "quotagate::middleware",
                    client = %prepared.client.identity,
                    endpoint = %prepared.endpoint,
                    "whitelisted"
                );
                return inner.call(req).await;
            }

            let rules = prepared.rules.resolve_http(&prepared.client, &prepared.endpoint);
            let client = &prepared.client.identity;
            let decision =
                enforcer.engine.evaluate(client, &prepared.endpoint, &rules, Namespace::Http).await;

            match decision {
                Decision::Denied { rule, .. } => {
                    enforcer.monitor.log_violation(client, &prepared.endpoint, &rule.descriptor());
                    Ok(too_many_requests(&rule))
                }
                Decision::Allowed { binding, store_error, .. } => {
                    if store_error.is_some() {
                        enforcer.monitor.record_store_failure();
                    }
                    if let Some(quota) = &binding {
                        req.extensions_mut().insert(quota.info.clone());
                    }
                    let mut response = inner.call(req).await?;
                    if let Some(quota) = binding {
                        apply_quota_headers(response.headers_mut(), &quota.info);
                    }
                    Ok(response)
                }
            }
        })
    }
}
