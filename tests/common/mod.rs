#![allow(dead_code)]

use std::convert::Infallible;
use std::future::{ready, Ready};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{HeaderValue, Method, Request, Response};
use quotagate::{
    AuthenticatedSubject, ClientAddr, CounterStore, InMemoryCounterStore, ManualClock,
    RateLimitConfig, RateLimitGateway, RateLimitInfo, RateLimitService, WebSocketRateLimitService,
};
use tower::{Service, ServiceBuilder};

pub const T0: u64 = 1_700_000_000_000;

pub type Stack = WebSocketRateLimitService<RateLimitService<Echo>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Backend stand-in: answers 200 `ok`, counts calls, and echoes the binding
/// remaining count it saw as `x-handler-remaining`.
#[derive(Clone, Debug, Default)]
pub struct Echo {
    hits: Arc<AtomicUsize>,
}

impl Echo {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Service<Request<String>> for Echo {
    type Response = Response<String>;
    type Error = Infallible;
    type Future = Ready<Result<Response<String>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<String>) -> Self::Future {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let mut response = Response::new("ok".to_string());
        if let Some(info) = req.extensions().get::<RateLimitInfo>() {
            response
                .headers_mut()
                .insert("x-handler-remaining", HeaderValue::from(info.remaining()));
        }
        ready(Ok(response))
    }
}

pub struct Harness {
    pub gateway: RateLimitGateway,
    pub clock: ManualClock,
    pub store: InMemoryCounterStore,
    pub echo: Echo,
    pub svc: Stack,
}

impl Harness {
    pub fn new(config: &str) -> Self {
        let clock = ManualClock::starting_at(T0);
        let store = InMemoryCounterStore::with_clock(Arc::new(clock.clone()));
        Self::with_store(config, clock, store.clone(), Arc::new(store))
    }

    pub fn with_store(
        config: &str,
        clock: ManualClock,
        store: InMemoryCounterStore,
        backend: Arc<dyn CounterStore>,
    ) -> Self {
        init_tracing();
        let runtime = RateLimitConfig::from_json_str(config)
            .expect("valid json")
            .build_runtime()
            .expect("valid config");
        let gateway = RateLimitGateway::with_clock(
            runtime.rules,
            backend,
            runtime.settings,
            Arc::new(clock.clone()),
        );
        let echo = Echo::default();
        let svc = ServiceBuilder::new()
            .layer(gateway.websocket_layer())
            .layer(gateway.http_layer())
            .service(echo.clone());
        Self { gateway, clock, store, echo, svc }
    }

    pub async fn send(&self, req: Request<String>) -> Response<String> {
        use tower::ServiceExt;
        self.svc.clone().oneshot(req).await.unwrap()
    }
}

pub fn request(method: Method, path: &str) -> Request<String> {
    Request::builder().method(method).uri(path).body(String::new()).unwrap()
}

pub fn from_user(mut req: Request<String>, id: &str) -> Request<String> {
    req.extensions_mut().insert(AuthenticatedSubject(id.to_string()));
    req
}

pub fn from_ip(mut req: Request<String>, ip: &str) -> Request<String> {
    let addr: SocketAddr = format!("{ip}:40000").parse().unwrap();
    req.extensions_mut().insert(ClientAddr(addr));
    req
}

pub fn upgrade(path: &str, ip: &str) -> Request<String> {
    let req = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header("connection", "Upgrade")
        .header("upgrade", "websocket")
        .body(String::new())
        .unwrap();
    from_ip(req, ip)
}

pub fn header<'a>(res: &'a Response<String>, name: &str) -> Option<&'a str> {
    res.headers().get(name).and_then(|v| v.to_str().ok())
}
