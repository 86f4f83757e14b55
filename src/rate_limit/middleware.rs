//! Tower middleware exposing admission as a composable layer.
//!
//! For services that embed the limiter without the full proxy:
//! [`AdmissionLayer`] wraps any inner `Service`, spends one quota unit per
//! request, and short-circuits denials before the inner service runs. The
//! caller supplies a key extractor, so the middleware stays agnostic about
//! the request type.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tower_layer::Layer;
use tower_service::Service;

use crate::error::AdmissionError;
use crate::identity::RateLimitKey;
use crate::rate_limit::{CounterStore, DistributedLock, RateLimiter};

/// Error surface of [`AdmissionService`]: the admission layer said no, or
/// the inner service failed on its own.
#[derive(Debug, Error)]
pub enum GateError<E> {
    #[error(transparent)]
    Admission(AdmissionError),
    #[error(transparent)]
    Inner(E),
}

impl<E> GateError<E> {
    /// Check if this is a quota denial.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Admission(e) if e.is_rate_limited())
    }

    /// Borrow the admission error, if that side failed.
    pub fn as_admission(&self) -> Option<&AdmissionError> {
        match self {
            Self::Admission(e) => Some(e),
            Self::Inner(_) => None,
        }
    }
}

/// Layer applying check-and-consume admission in front of a service.
///
/// The key function maps a request to its quota key and whether the caller
/// counts as authenticated.
pub struct AdmissionLayer<S, L, F> {
    limiter: Arc<RateLimiter<S, L>>,
    key_fn: Arc<F>,
}

impl<S, L, F> AdmissionLayer<S, L, F> {
    pub fn new(limiter: RateLimiter<S, L>, key_fn: F) -> Self {
        Self { limiter: Arc::new(limiter), key_fn: Arc::new(key_fn) }
    }
}

impl<S, L, F> Clone for AdmissionLayer<S, L, F> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), key_fn: self.key_fn.clone() }
    }
}

impl<S, L, F> fmt::Debug for AdmissionLayer<S, L, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer").finish_non_exhaustive()
    }
}

impl<Inner, S, L, F> Layer<Inner> for AdmissionLayer<S, L, F> {
    type Service = AdmissionService<Inner, S, L, F>;

    fn layer(&self, service: Inner) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: self.limiter.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<Inner, S, L, F> {
    inner: Inner,
    limiter: Arc<RateLimiter<S, L>>,
    key_fn: Arc<F>,
}

impl<Inner: Clone, S, L, F> Clone for AdmissionService<Inner, S, L, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<Inner: fmt::Debug, S, L, F> fmt::Debug for AdmissionService<Inner, S, L, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<Inner, S, L, F, Req> Service<Req> for AdmissionService<Inner, S, L, F>
where
    Inner: Service<Req> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: CounterStore + 'static,
    L: DistributedLock + 'static,
    F: Fn(&Req) -> (RateLimitKey, bool) + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = Inner::Response;
    type Error = GateError<Inner::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, request: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let key_fn = self.key_fn.clone();
        // Swap in the clone and keep the instance poll_ready vouched for.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (key, is_authenticated) = key_fn(&request);
            match limiter.check_and_consume(&key, is_authenticated).await {
                Ok(admission) if admission.is_admitted() => {
                    inner.call(request).await.map_err(GateError::Inner)
                }
                Ok(admission) => Err(GateError::Admission(AdmissionError::RateLimited {
                    retry_after: admission.retry_after,
                    limit: admission.limit,
                    window: limiter.config().window,
                })),
                Err(error) => Err(GateError::Admission(error)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::rate_limit::{InMemoryLock, InMemoryStore, LockToken, QuotaConfig, QuotaLimits, Strategy};
    use crate::sleeper::InstantSleeper;
    use async_trait::async_trait;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Clone, Default)]
    struct Echo {
        calls: Arc<AtomicUsize>,
    }

    impl Service<String> for Echo {
        type Response = String;
        type Error = Infallible;
        type Future = std::future::Ready<Result<String, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: String) -> Self::Future {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(format!("echo: {request}")))
        }
    }

    fn limiter(authenticated: u32, anonymous: u32) -> RateLimiter<InMemoryStore, InMemoryLock> {
        let config = QuotaConfig::new(
            Duration::from_secs(60),
            QuotaLimits { authenticated, anonymous },
            Strategy::TokenBucket,
        )
        .unwrap();
        RateLimiter::new(config, InMemoryStore::new(), InMemoryLock::new())
    }

    fn by_sender(request: &String) -> (RateLimitKey, bool) {
        (RateLimitKey::from_raw(format!("test:{request}")), false)
    }

    #[tokio::test]
    async fn admitted_requests_reach_the_inner_service() {
        let echo = Echo::default();
        let service = AdmissionLayer::new(limiter(5, 5), by_sender).layer(echo.clone());

        let reply = service.clone().oneshot("alpha".to_string()).await.unwrap();
        assert_eq!(reply, "echo: alpha");
        let reply = service.oneshot("alpha".to_string()).await.unwrap();
        assert_eq!(reply, "echo: alpha");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn denials_short_circuit_before_the_inner_service() {
        let echo = Echo::default();
        let service = AdmissionLayer::new(limiter(1, 1), by_sender).layer(echo.clone());

        service.clone().oneshot("alpha".to_string()).await.unwrap();
        let err = service.clone().oneshot("alpha".to_string()).await.unwrap_err();

        assert!(err.is_rate_limited());
        let admission = err.as_admission().unwrap();
        assert_eq!(admission.retry_after().map(|d| d > Duration::ZERO), Some(true));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);

        // A different sender has its own counter.
        let reply = service.oneshot("beta".to_string()).await.unwrap();
        assert_eq!(reply, "echo: beta");
    }

    #[tokio::test]
    async fn separate_keys_do_not_share_quota() {
        let echo = Echo::default();
        let service = AdmissionLayer::new(limiter(1, 1), by_sender).layer(echo.clone());

        for sender in ["a", "b", "c"] {
            let reply = service.clone().oneshot(sender.to_string()).await.unwrap();
            assert_eq!(reply, format!("echo: {sender}"));
        }
        assert_eq!(echo.calls.load(Ordering::SeqCst), 3);
    }

    #[derive(Debug)]
    struct ContendedLock;

    #[async_trait]
    impl DistributedLock for ContendedLock {
        type Error = Infallible;

        async fn try_acquire(
            &self,
            _key: &str,
            _ttl: Duration,
        ) -> Result<Option<LockToken>, Self::Error> {
            Ok(None)
        }

        async fn release(&self, _key: &str, _token: &LockToken) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn infrastructure_trouble_is_not_a_denial() {
        let config = QuotaConfig::new(
            Duration::from_secs(60),
            QuotaLimits { authenticated: 5, anonymous: 5 },
            Strategy::TokenBucket,
        )
        .unwrap();
        let limiter = RateLimiter::with_clock_and_sleeper(
            config,
            InMemoryStore::new(),
            ContendedLock,
            Arc::new(ManualClock::new(1_000_000)),
            Arc::new(InstantSleeper),
        );
        let service = AdmissionLayer::new(limiter, by_sender).layer(Echo::default());

        let err = service.oneshot("alpha".to_string()).await.unwrap_err();
        assert!(!err.is_rate_limited());
        assert!(err.as_admission().unwrap().is_lock_contended());
    }
}
