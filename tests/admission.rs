//! End-to-end gateway scenarios: quota accounting, breaker isolation, and
//! header rewriting observed from outside, through the public surface only.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tower::ServiceExt;

use tollgate::proxy::{Downstream, DownstreamResponse, DownstreamTarget, ForwardRequest};
use tollgate::rate_limit::{AdmissionLayer, GateError, InMemoryLock, InMemoryStore};
use tollgate::{
    AdmissionConfig, BreakerConfig, CircuitState, DownstreamError, GatewayResponse,
    InboundRequest, QuotaConfig, QuotaLimits, RateLimitKey, RateLimiter, RequestIdentity,
    ServiceProxy, Strategy,
};

#[tokio::test]
async fn a_burst_counts_down_quota_headers_until_denial() {
    let backend = ScriptedBackend::default();
    let proxy = ServiceProxy::new(
        config(3, 5, Duration::from_secs(30)),
        InMemoryStore::new(),
        InMemoryLock::new(),
        backend.clone(),
    );

    for expected_remaining in ["2", "1", "0"] {
        let response = proxy.handle(request("/v1/orders"), &billing()).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), "3");
        assert_eq!(header(&response, "x-ratelimit-remaining"), expected_remaining);
        assert!(!header(&response, "x-ratelimit-reset").is_empty());
        assert!(!header(&response, "x-correlation-id").is_empty());
    }

    let denied = proxy.handle(request("/v1/orders"), &billing()).await;
    assert_eq!(denied.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&denied, "x-ratelimit-remaining"), "0");
    let body = body_json(&denied);
    assert_eq!(body["error"], "rate limit exceeded");
    assert_eq!(body["limit"], 3);
    assert_eq!(body["windowMs"], 60_000);
    let hint = body["retryAfter"].as_u64().unwrap();
    assert!((1..=60).contains(&hint));
    assert_eq!(header(&denied, "retry-after"), hint.to_string());

    // The backend never saw the denied request.
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn identity_and_correlation_flow_through_to_the_backend() {
    let backend = ScriptedBackend::default();
    let proxy = ServiceProxy::new(
        config(10, 5, Duration::from_secs(30)),
        InMemoryStore::new(),
        InMemoryLock::new(),
        backend.clone(),
    );

    let mut headers = HeaderMap::new();
    headers.insert("x-correlation-id", HeaderValue::from_static("e2e-42"));
    // A spoofed identity header must not survive to the backend.
    headers.insert("x-user-id", HeaderValue::from_static("admin"));
    let inbound = InboundRequest::new(
        Method::POST,
        "/v1/charge",
        RequestIdentity::authenticated("u-100", peer()).with_role("member"),
    )
    .with_headers(headers)
    .with_body(b"{\"amount\":5}".to_vec());

    let response = proxy.handle(inbound, &billing()).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(header(&response, "x-correlation-id"), "e2e-42");

    let forwarded = backend.last_forwarded();
    assert_eq!(forwarded.method, Method::POST);
    assert_eq!(forwarded.path, "/v1/charge");
    assert_eq!(forwarded.body, b"{\"amount\":5}");
    let seen =
        |name: &str| forwarded.headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default();
    assert_eq!(seen("x-correlation-id"), "e2e-42");
    assert_eq!(seen("x-user-id"), "u-100");
    assert_eq!(seen("x-user-role"), "member");
    assert_eq!(seen("x-forwarded-for"), "203.0.113.77");
}

#[tokio::test]
async fn repeated_failures_trip_the_breaker_and_a_probe_recovers_it() {
    let backend = ScriptedBackend::default();
    backend.push_err(connect_failure());
    backend.push_err(connect_failure());
    let proxy = ServiceProxy::new(
        config(100, 2, Duration::from_millis(150)),
        InMemoryStore::new(),
        InMemoryLock::new(),
        backend.clone(),
    );

    for _ in 0..2 {
        let response = proxy.handle(request("/v1/orders"), &billing()).await;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    }
    let breaker = proxy.breakers().get("billing").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    // An open circuit answers without touching the backend.
    let rejected = proxy.handle(request("/v1/orders"), &billing()).await;
    assert_eq!(rejected.status, StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(&rejected);
    assert_eq!(body["error"], "service temporarily unavailable");
    assert_eq!(body["service"], "billing");
    assert_eq!(backend.calls(), 2);

    // After the reset timeout one successful probe closes it again.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let recovered = proxy.handle(request("/v1/orders"), &billing()).await;
    assert_eq!(recovered.status, StatusCode::OK);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(backend.calls(), 3);

    let metrics = breaker.metrics();
    assert_eq!(metrics.total_calls, 3);
    assert_eq!(metrics.failed_calls, 2);
    assert_eq!(metrics.consecutive_failures, 0);
}

#[tokio::test]
async fn sibling_services_trip_independently() {
    let backend = ScriptedBackend::default();
    backend.push_err(connect_failure());
    let proxy = ServiceProxy::new(
        config(100, 1, Duration::from_secs(30)),
        InMemoryStore::new(),
        InMemoryLock::new(),
        backend.clone(),
    );
    let search = DownstreamTarget::new("search", "http://search.internal:8080");

    // One connect failure trips billing at threshold one.
    let failed = proxy.handle(request("/v1/orders"), &billing()).await;
    assert_eq!(failed.status, StatusCode::BAD_GATEWAY);
    let isolated = proxy.handle(request("/v1/orders"), &billing()).await;
    assert_eq!(isolated.status, StatusCode::SERVICE_UNAVAILABLE);

    // The sibling service keeps answering through its own breaker.
    let fine = proxy.handle(request("/v1/search"), &search).await;
    assert_eq!(fine.status, StatusCode::OK);

    let states: Vec<(String, CircuitState)> = proxy
        .breakers()
        .snapshot()
        .iter()
        .map(|s| (s.service.clone(), s.state))
        .collect();
    assert_eq!(
        states,
        vec![
            ("billing".to_string(), CircuitState::Open),
            ("search".to_string(), CircuitState::Closed),
        ]
    );
}

#[tokio::test]
async fn operator_reset_reopens_a_tripped_service() {
    let backend = ScriptedBackend::default();
    backend.push_err(connect_failure());
    let proxy = ServiceProxy::new(
        config(100, 1, Duration::from_secs(30)),
        InMemoryStore::new(),
        InMemoryLock::new(),
        backend.clone(),
    );

    proxy.handle(request("/v1/orders"), &billing()).await;
    assert_eq!(
        proxy.handle(request("/v1/orders"), &billing()).await.status,
        StatusCode::SERVICE_UNAVAILABLE
    );

    proxy.breakers().reset("billing").unwrap();
    let recovered = proxy.handle(request("/v1/orders"), &billing()).await;
    assert_eq!(recovered.status, StatusCode::OK);

    // Services never registered cannot be reset.
    assert!(proxy.breakers().reset("imaginary").is_err());
}

#[tokio::test]
async fn the_tower_layer_gates_requests_by_sender() {
    let quota = QuotaConfig::new(
        Duration::from_secs(60),
        QuotaLimits { authenticated: 2, anonymous: 2 },
        Strategy::TokenBucket,
    )
    .unwrap()
    .with_cache_ttl(Duration::ZERO)
    .unwrap();
    let limiter = RateLimiter::new(quota, InMemoryStore::new(), InMemoryLock::new());
    let layer = AdmissionLayer::new(limiter, |request: &String| {
        (RateLimitKey::from_raw(format!("test:{request}")), true)
    });

    let service =
        tower::ServiceBuilder::new().layer(layer).service_fn(|request: String| async move {
            Ok::<_, std::convert::Infallible>(format!("handled {request}"))
        });

    for _ in 0..2 {
        let reply = service.clone().oneshot("alice".to_string()).await.unwrap();
        assert_eq!(reply, "handled alice");
    }

    let denied = service.clone().oneshot("alice".to_string()).await.unwrap_err();
    assert!(matches!(&denied, GateError::Admission(e) if e.is_rate_limited()));
    assert!(denied.as_admission().and_then(|e| e.retry_after()).unwrap() > Duration::ZERO);

    // A different sender has an untouched budget.
    let reply = service.clone().oneshot("bob".to_string()).await.unwrap();
    assert_eq!(reply, "handled bob");
}

fn peer() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(203, 0, 113, 77))
}

fn config(auth_limit: u32, failure_threshold: u32, reset_timeout: Duration) -> AdmissionConfig {
    AdmissionConfig::new(
        "test",
        QuotaConfig::new(
            Duration::from_secs(60),
            QuotaLimits { authenticated: auth_limit, anonymous: auth_limit },
            Strategy::TokenBucket,
        )
        .unwrap(),
        BreakerConfig::new(failure_threshold, reset_timeout, Duration::from_secs(10)).unwrap(),
        Duration::from_secs(2),
    )
    .unwrap()
}

fn request(path: &str) -> InboundRequest {
    InboundRequest::new(Method::GET, path, RequestIdentity::authenticated("u-100", peer()))
}

fn billing() -> DownstreamTarget {
    DownstreamTarget::new("billing", "http://billing.internal:8080")
}

fn connect_failure() -> DownstreamError {
    DownstreamError::Connect { service: "billing".into(), detail: "connection refused".into() }
}

fn header<'a>(response: &'a GatewayResponse, name: &str) -> &'a str {
    response.headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default()
}

fn body_json(response: &GatewayResponse) -> serde_json::Value {
    serde_json::from_slice(&response.body).unwrap()
}

/// Transport fake driven by a queue of scripted outcomes. Records every
/// forwarded request; an empty queue answers 200 with an empty object.
#[derive(Debug, Clone, Default)]
struct ScriptedBackend {
    inner: Arc<BackendInner>,
}

#[derive(Debug, Default)]
struct BackendInner {
    script: Mutex<VecDeque<Result<DownstreamResponse, DownstreamError>>>,
    calls: AtomicUsize,
    forwarded: Mutex<Vec<ForwardRequest>>,
}

impl ScriptedBackend {
    fn push_err(&self, error: DownstreamError) {
        self.inner.script.lock().unwrap().push_back(Err(error));
    }

    fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    fn last_forwarded(&self) -> ForwardRequest {
        self.inner.forwarded.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Downstream for ScriptedBackend {
    async fn call(
        &self,
        _target: &DownstreamTarget,
        request: ForwardRequest,
    ) -> Result<DownstreamResponse, DownstreamError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.forwarded.lock().unwrap().push(request);
        self.inner.script.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(DownstreamResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: b"{}".to_vec(),
            })
        })
    }
}
