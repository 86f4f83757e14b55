//! Guarded request forwarding.
//!
//! [`ServiceProxy::handle`] is the single entry point: derive the quota key
//! from the resolved identity and spend one unit of quota, then run the
//! downstream call under the target's circuit breaker and normalize whatever
//! happens into an HTTP-shaped [`GatewayResponse`]. It never returns an error;
//! internal failures become 429/502/503 responses with actionable retry
//! hints and nothing else. Downstream error details stay in the logs.
//!
//! The proxy retries nothing on its own. Retry policy belongs to callers
//! who can see the `Retry-After` hints.

mod downstream;
mod headers;

pub use downstream::{
    Downstream, DownstreamResponse, DownstreamTarget, ForwardRequest, HttpDownstream,
};
pub use headers::{
    X_CORRELATION_ID, X_FORWARDED_FOR, X_RATE_LIMIT_LIMIT, X_RATE_LIMIT_REMAINING,
    X_RATE_LIMIT_RESET, X_USER_ID, X_USER_ROLE,
};

use std::sync::Arc;
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::circuit_breaker_registry::BreakerRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, DownstreamError};
use crate::identity::{RateLimitKey, RequestIdentity};
use crate::rate_limit::{Admission, CounterStore, DistributedLock, RateLimiter};

/// Inbound request as the gateway hands it to the proxy, authentication
/// already resolved.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub identity: RequestIdentity,
}

impl InboundRequest {
    pub fn new(method: Method, path: impl Into<String>, identity: RequestIdentity) -> Self {
        Self { method, path: path.into(), headers: HeaderMap::new(), body: Vec::new(), identity }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

/// HTTP-shaped response the gateway returns to its caller.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl GatewayResponse {
    fn json(status: StatusCode, body: serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self { status, headers, body: body.to_string().into_bytes() }
    }
}

/// Admission-controlled forwarder for one route.
///
/// Holds the route's rate limiter, the per-service breaker registry, and
/// the downstream transport. One proxy serves every request task in a
/// gateway instance.
#[derive(Debug)]
pub struct ServiceProxy<S, L, D> {
    environment: String,
    limiter: RateLimiter<S, L>,
    breakers: BreakerRegistry,
    downstream: Arc<D>,
    downstream_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl<S, L, D> ServiceProxy<S, L, D>
where
    S: CounterStore,
    L: DistributedLock,
    D: Downstream,
{
    /// Proxy from one validated config bundle over the given backends.
    pub fn new(config: AdmissionConfig, store: S, lock: L, downstream: D) -> Self {
        let AdmissionConfig { environment, quota, breaker, downstream_timeout } = config;
        Self {
            environment,
            limiter: RateLimiter::new(quota, store, lock),
            breakers: BreakerRegistry::new(breaker),
            downstream: Arc::new(downstream),
            downstream_timeout,
            clock: Arc::new(SystemClock),
        }
    }

    /// Assemble from prebuilt parts. Tests wire manual-clock limiters and
    /// preconfigured breaker registries through here.
    pub fn from_parts(
        environment: impl Into<String>,
        limiter: RateLimiter<S, L>,
        breakers: BreakerRegistry,
        downstream: D,
        downstream_timeout: Duration,
    ) -> Self {
        Self {
            environment: environment.into(),
            limiter,
            breakers,
            downstream: Arc::new(downstream),
            downstream_timeout,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn limiter(&self) -> &RateLimiter<S, L> {
        &self.limiter
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Forward one request through admission control.
    ///
    /// Never returns an error: quota denials come back as 429 with quota
    /// headers and a `Retry-After`, open circuits and admission
    /// infrastructure trouble as 503, downstream failures as 502. An
    /// admitted request carries quota headers on its response whatever the
    /// downstream does.
    pub async fn handle(
        &self,
        request: InboundRequest,
        target: &DownstreamTarget,
    ) -> GatewayResponse {
        let correlation_id = headers::correlation_id(&request.headers);
        let key = RateLimitKey::derive(&self.environment, &request.identity);

        let admission = match self
            .limiter
            .check_and_consume(&key, request.identity.is_authenticated())
            .await
        {
            Ok(admission) => admission,
            Err(error) => return self.admission_failure(&error, &correlation_id),
        };

        if !admission.is_admitted() {
            debug!(
                key = %key,
                service = %target.service,
                correlation_id = %correlation_id,
                "request denied by quota"
            );
            return self.rate_limited(&admission, &correlation_id);
        }

        let InboundRequest { method, path, headers: mut forward_headers, body, identity } =
            request;
        headers::apply_forwarding(&mut forward_headers, &identity, &correlation_id);
        let forward = ForwardRequest { method, path, headers: forward_headers, body };

        let breaker = self.breakers.get_or_create(&target.service);
        let outcome = breaker.execute(|| self.guarded_call(target, forward)).await;

        match outcome {
            Ok(response) => {
                debug!(
                    service = %target.service,
                    status = %response.status,
                    correlation_id = %correlation_id,
                    "downstream response forwarded"
                );
                let mut response =
                    GatewayResponse { status: response.status, headers: response.headers, body: response.body };
                self.annotate(&mut response, &admission, &correlation_id);
                response
            }
            Err(error) => self.execution_failure(&error, &admission, target, &correlation_id),
        }
    }

    /// The call the breaker guards: transport plus the timeout and 2xx
    /// policies, so timeouts and error statuses count as breaker failures.
    async fn guarded_call(
        &self,
        target: &DownstreamTarget,
        request: ForwardRequest,
    ) -> Result<DownstreamResponse, DownstreamError> {
        let started = self.clock.now_millis();
        let response = match timeout(
            self.downstream_timeout,
            self.downstream.call(target, request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                let elapsed =
                    Duration::from_millis(self.clock.now_millis().saturating_sub(started));
                return Err(DownstreamError::Timeout {
                    service: target.service.clone(),
                    elapsed,
                    limit: self.downstream_timeout,
                });
            }
        };
        if !response.status.is_success() {
            return Err(DownstreamError::Status {
                service: target.service.clone(),
                status: response.status,
            });
        }
        Ok(response)
    }

    fn rate_limited(&self, admission: &Admission, correlation_id: &str) -> GatewayResponse {
        let retry_secs = ceil_secs(admission.retry_after);
        let window = self.limiter.config().window;
        let mut response = GatewayResponse::json(
            StatusCode::TOO_MANY_REQUESTS,
            json!({
                "error": "rate limit exceeded",
                "retryAfter": retry_secs,
                "limit": admission.limit,
                "windowMs": u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            }),
        );
        headers::insert_str(&mut response.headers, "retry-after", &retry_secs.to_string());
        self.annotate(&mut response, admission, correlation_id);
        response
    }

    /// Lock contention, store trouble, or a limiter already shut down. No
    /// quota numbers exist for these, so no quota headers either.
    fn admission_failure(&self, error: &AdmissionError, correlation_id: &str) -> GatewayResponse {
        warn!(error = %error, correlation_id = %correlation_id, "admission infrastructure failure");
        let mut response = GatewayResponse::json(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "error": "admission temporarily unavailable",
                "retryAfter": 1,
            }),
        );
        headers::insert_str(&mut response.headers, "retry-after", "1");
        headers::insert_str(&mut response.headers, X_CORRELATION_ID, correlation_id);
        response
    }

    fn execution_failure(
        &self,
        error: &AdmissionError,
        admission: &Admission,
        target: &DownstreamTarget,
        correlation_id: &str,
    ) -> GatewayResponse {
        let mut response = match error {
            AdmissionError::CircuitOpen { service, retry_after } => {
                let retry_secs = ceil_secs(*retry_after);
                debug!(
                    service = %service,
                    correlation_id = %correlation_id,
                    "rejected by open circuit"
                );
                let mut response = GatewayResponse::json(
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({
                        "error": "service temporarily unavailable",
                        "service": service,
                        "retryAfter": retry_secs,
                    }),
                );
                headers::insert_str(&mut response.headers, "retry-after", &retry_secs.to_string());
                response
            }
            AdmissionError::Downstream(downstream) => {
                warn!(
                    service = %target.service,
                    error = %downstream,
                    correlation_id = %correlation_id,
                    "downstream call failed"
                );
                GatewayResponse::json(
                    StatusCode::BAD_GATEWAY,
                    json!({
                        "error": "bad gateway",
                        "service": target.service,
                    }),
                )
            }
            // Guarded execution only produces the two variants above.
            other => {
                warn!(error = %other, correlation_id = %correlation_id, "unexpected execution failure");
                GatewayResponse::json(
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({
                        "error": "service temporarily unavailable",
                        "service": target.service,
                    }),
                )
            }
        };
        self.annotate(&mut response, admission, correlation_id);
        response
    }

    /// Quota headers plus the gateway-owned correlation header. Overwrites
    /// anything the downstream set under the same names.
    fn annotate(&self, response: &mut GatewayResponse, admission: &Admission, correlation_id: &str) {
        headers::apply_quota(
            &mut response.headers,
            admission.limit,
            admission.remaining,
            admission.reset_at_millis,
        );
        headers::insert_str(&mut response.headers, X_CORRELATION_ID, correlation_id);
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis().div_ceil(1000)).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerConfig;
    use crate::rate_limit::{InMemoryLock, InMemoryStore, QuotaConfig, QuotaLimits, Strategy};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeInner {
        responses: Mutex<VecDeque<Result<DownstreamResponse, DownstreamError>>>,
        calls: AtomicUsize,
        seen_headers: Mutex<Vec<HeaderMap>>,
    }

    #[derive(Clone, Default)]
    struct FakeDownstream(Arc<FakeInner>);

    impl FakeDownstream {
        fn ok(status: StatusCode, body: &[u8]) -> Self {
            let fake = Self::default();
            fake.push(Ok(DownstreamResponse {
                status,
                headers: HeaderMap::new(),
                body: body.to_vec(),
            }));
            fake
        }

        fn push(&self, result: Result<DownstreamResponse, DownstreamError>) {
            self.0.responses.lock().unwrap().push_back(result);
        }

        fn calls(&self) -> usize {
            self.0.calls.load(Ordering::SeqCst)
        }

        fn last_headers(&self) -> HeaderMap {
            self.0.seen_headers.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Downstream for FakeDownstream {
        async fn call(
            &self,
            _target: &DownstreamTarget,
            request: ForwardRequest,
        ) -> Result<DownstreamResponse, DownstreamError> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            self.0.seen_headers.lock().unwrap().push(request.headers.clone());
            self.0
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected downstream call")
        }
    }

    /// Transport that never answers; only the proxy timeout ends the call.
    struct StuckDownstream;

    #[async_trait]
    impl Downstream for StuckDownstream {
        async fn call(
            &self,
            _target: &DownstreamTarget,
            _request: ForwardRequest,
        ) -> Result<DownstreamResponse, DownstreamError> {
            std::future::pending().await
        }
    }

    #[derive(Debug)]
    struct ContendedLock;

    #[async_trait]
    impl DistributedLock for ContendedLock {
        type Error = std::convert::Infallible;

        async fn try_acquire(
            &self,
            _key: &str,
            _ttl: Duration,
        ) -> Result<Option<crate::rate_limit::LockToken>, Self::Error> {
            Ok(None)
        }

        async fn release(
            &self,
            _key: &str,
            _token: &crate::rate_limit::LockToken,
        ) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    fn peer() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2))
    }

    fn config(limit: u32, failure_threshold: u32) -> AdmissionConfig {
        let quota = QuotaConfig::new(
            Duration::from_secs(60),
            QuotaLimits { authenticated: limit, anonymous: limit },
            Strategy::TokenBucket,
        )
        .unwrap();
        let breaker =
            BreakerConfig::new(failure_threshold, Duration::from_secs(30), Duration::from_secs(10))
                .unwrap();
        AdmissionConfig::new("test", quota, breaker, Duration::from_secs(5)).unwrap()
    }

    fn proxy(
        limit: u32,
        failure_threshold: u32,
        fake: &FakeDownstream,
    ) -> ServiceProxy<InMemoryStore, InMemoryLock, FakeDownstream> {
        ServiceProxy::new(config(limit, failure_threshold), InMemoryStore::new(), InMemoryLock::new(), fake.clone())
    }

    fn request() -> InboundRequest {
        InboundRequest::new(Method::GET, "/v1/things", RequestIdentity::authenticated("u-1", peer()))
    }

    fn billing() -> DownstreamTarget {
        DownstreamTarget::new("billing", "http://billing.internal")
    }

    fn body_json(response: &GatewayResponse) -> serde_json::Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    fn header<'a>(response: &'a GatewayResponse, name: &str) -> &'a str {
        response.headers.get(name).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn success_propagates_status_body_and_quota_headers() {
        let fake = FakeDownstream::ok(StatusCode::OK, b"hello");
        let proxy = proxy(5, 3, &fake);

        let response = proxy.handle(request(), &billing()).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, b"hello");
        assert_eq!(header(&response, X_RATE_LIMIT_LIMIT), "5");
        assert_eq!(header(&response, X_RATE_LIMIT_REMAINING), "4");
        assert!(response.headers.get(X_RATE_LIMIT_RESET).is_some());
        assert!(response.headers.get(X_CORRELATION_ID).is_some());
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn forwarding_headers_are_attached_before_the_call() {
        let fake = FakeDownstream::ok(StatusCode::OK, b"{}");
        let proxy = proxy(5, 3, &fake);

        let mut inbound_headers = HeaderMap::new();
        inbound_headers.insert(X_USER_ID, HeaderValue::from_static("intruder"));
        let request = InboundRequest::new(
            Method::POST,
            "/v1/things",
            RequestIdentity::authenticated("u-1", peer()).with_role("editor"),
        )
        .with_headers(inbound_headers);

        proxy.handle(request, &billing()).await;

        let seen = fake.last_headers();
        assert_eq!(seen.get(X_USER_ID).unwrap(), "u-1");
        assert_eq!(seen.get(X_USER_ROLE).unwrap(), "editor");
        assert_eq!(seen.get(X_FORWARDED_FOR).unwrap(), "198.51.100.2");
        assert!(seen.get(X_CORRELATION_ID).is_some());
    }

    #[tokio::test]
    async fn inbound_correlation_id_survives_to_both_sides() {
        let fake = FakeDownstream::ok(StatusCode::OK, b"{}");
        let proxy = proxy(5, 3, &fake);

        let mut inbound_headers = HeaderMap::new();
        inbound_headers.insert(X_CORRELATION_ID, HeaderValue::from_static("cid-123"));
        let request = request().with_headers(inbound_headers);

        let response = proxy.handle(request, &billing()).await;

        assert_eq!(fake.last_headers().get(X_CORRELATION_ID).unwrap(), "cid-123");
        assert_eq!(header(&response, X_CORRELATION_ID), "cid-123");
    }

    #[tokio::test]
    async fn quota_denial_is_a_429_with_retry_hints() {
        let fake = FakeDownstream::ok(StatusCode::OK, b"ok");
        let proxy = proxy(1, 3, &fake);

        let first = proxy.handle(request(), &billing()).await;
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(header(&first, X_RATE_LIMIT_REMAINING), "0");

        let denied = proxy.handle(request(), &billing()).await;
        assert_eq!(denied.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&denied, X_RATE_LIMIT_REMAINING), "0");

        let retry_header: u64 = header(&denied, "retry-after").parse().unwrap();
        assert!(retry_header >= 1);

        let body = body_json(&denied);
        assert_eq!(body["error"], "rate limit exceeded");
        assert_eq!(body["limit"], 1);
        assert_eq!(body["windowMs"], 60_000);
        assert!(body["retryAfter"].as_u64().unwrap() >= 1);

        // The denied request never reached the downstream.
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn downstream_connect_failure_is_an_opaque_502() {
        let fake = FakeDownstream::default();
        fake.push(Err(DownstreamError::Connect {
            service: "billing".into(),
            detail: "connection refused (10.3.7.21:9402)".into(),
        }));
        let proxy = proxy(5, 3, &fake);

        let response = proxy.handle(request(), &billing()).await;

        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        let body = body_json(&response);
        assert_eq!(body["error"], "bad gateway");
        assert_eq!(body["service"], "billing");
        // Connection details stay in the logs, not the response.
        assert!(!String::from_utf8_lossy(&response.body).contains("10.3.7.21"));
        // The admitted request still carries quota headers.
        assert_eq!(header(&response, X_RATE_LIMIT_LIMIT), "5");
    }

    #[tokio::test]
    async fn error_statuses_normalize_to_502_and_count_against_the_breaker() {
        let fake = FakeDownstream::ok(StatusCode::INTERNAL_SERVER_ERROR, b"stack trace here");
        let proxy = proxy(5, 3, &fake);

        let response = proxy.handle(request(), &billing()).await;

        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert!(!String::from_utf8_lossy(&response.body).contains("stack trace"));

        let breaker = proxy.breakers().get("billing").unwrap();
        assert_eq!(breaker.metrics().failed_calls, 1);
    }

    #[tokio::test]
    async fn open_circuit_answers_503_without_calling_downstream() {
        let fake = FakeDownstream::default();
        fake.push(Err(DownstreamError::Connect {
            service: "billing".into(),
            detail: "connection refused".into(),
        }));
        let proxy = proxy(10, 1, &fake);

        let tripped = proxy.handle(request(), &billing()).await;
        assert_eq!(tripped.status, StatusCode::BAD_GATEWAY);

        let rejected = proxy.handle(request(), &billing()).await;
        assert_eq!(rejected.status, StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(&rejected);
        assert_eq!(body["service"], "billing");
        assert_eq!(body["retryAfter"], 30);
        assert_eq!(header(&rejected, "retry-after"), "30");
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn lock_contention_is_a_503_not_a_denial() {
        let quota = QuotaConfig::new(
            Duration::from_secs(60),
            QuotaLimits { authenticated: 5, anonymous: 5 },
            Strategy::TokenBucket,
        )
        .unwrap()
        .with_lock_timing(Duration::from_secs(3), Duration::from_millis(50), Duration::from_millis(10))
        .unwrap();
        let limiter = RateLimiter::new(quota, InMemoryStore::new(), ContendedLock);
        let proxy = ServiceProxy::from_parts(
            "test",
            limiter,
            BreakerRegistry::default(),
            FakeDownstream::default(),
            Duration::from_secs(5),
        );

        let response = proxy.handle(request(), &billing()).await;

        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(&response)["error"], "admission temporarily unavailable");
        assert_eq!(header(&response, "retry-after"), "1");
        assert!(response.headers.get(X_RATE_LIMIT_LIMIT).is_none());
    }

    #[tokio::test]
    async fn slow_downstream_times_out_into_502_with_breaker_accounting() {
        let quota = QuotaConfig::new(
            Duration::from_secs(60),
            QuotaLimits { authenticated: 5, anonymous: 5 },
            Strategy::TokenBucket,
        )
        .unwrap();
        let limiter = RateLimiter::new(quota, InMemoryStore::new(), InMemoryLock::new());
        let proxy = ServiceProxy::from_parts(
            "test",
            limiter,
            BreakerRegistry::default(),
            StuckDownstream,
            Duration::from_millis(20),
        );

        let response = proxy.handle(request(), &billing()).await;

        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(&response)["service"], "billing");

        let breaker = proxy.breakers().get("billing").unwrap();
        let metrics = breaker.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.failed_calls, 1);
    }
}
