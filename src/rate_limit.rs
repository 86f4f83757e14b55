//! Hybrid per-key rate limiting.
//!
//! Building blocks:
//! - [`RateLimiter`]: the admission decision, combining a sharded local
//!   cache fast path with an authoritative shared store.
//! - [`CounterStore`] / [`DistributedLock`]: the storage seams. In-memory
//!   implementations ship here; Redis-backed ones live behind the
//!   `redis-backend` feature.
//! - [`Strategy`]: token-bucket and leaky-bucket window math.
//!
//! The local cache may grant optimistically from its last authoritative
//! snapshot, bounded by `cache_ttl`, and records every such grant. Denials
//! are never decided locally: once the cached quota is exhausted or stale,
//! the limiter takes the key's distributed lock, folds the recorded local
//! grants plus the new request into the store, then refreshes the cache.
//! One instance therefore admits exactly `limit` requests per window, and a
//! fleet overshoots by at most the quota granted in one `cache_ttl`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adaptive::DynamicConfig;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, MAX_LOCK_WAIT};
use crate::error::AdmissionError;
use crate::identity::RateLimitKey;
use crate::sleeper::{Sleeper, TokioSleeper};

mod cache;
pub mod lock;
pub mod middleware;
#[cfg(feature = "redis-backend")]
pub mod redis;
pub mod store;
pub mod strategy;

pub use lock::{DistributedLock, InMemoryLock, LockToken};
pub use middleware::{AdmissionLayer, AdmissionService, GateError};
#[cfg(feature = "redis-backend")]
pub use redis::{RedisLock, RedisStore};
pub use store::{CounterStore, InMemoryStore, WindowState};
pub use strategy::Strategy;

use cache::QuotaCache;

/// Default freshness horizon for locally cached quota.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1);
/// Default TTL on the per-key distributed lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(3);
/// Default total wait for the lock before the request fails as contended.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(250);
/// Default pause between lock attempts.
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);
/// Default timeout on each store or lock round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Window quota per authentication class. The two classes key separately,
/// so they never share a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub authenticated: u32,
    pub anonymous: u32,
}

impl QuotaLimits {
    pub fn for_class(&self, is_authenticated: bool) -> u32 {
        if is_authenticated {
            self.authenticated
        } else {
            self.anonymous
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for limit in [self.authenticated, self.anonymous] {
            if limit == 0 {
                return Err(ConfigError::InvalidLimit { provided: limit });
            }
        }
        Ok(())
    }
}

/// Validated quota rules for one route.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub window: Duration,
    pub limits: QuotaLimits,
    pub strategy: Strategy,
    /// Freshness horizon for the local cache; zero disables the fast path.
    pub cache_ttl: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub lock_retry_interval: Duration,
    pub store_timeout: Duration,
}

impl QuotaConfig {
    /// Construct with conservative cache and lock defaults. The cache TTL
    /// defaults to one second, capped at half the window.
    pub fn new(
        window: Duration,
        limits: QuotaLimits,
        strategy: Strategy,
    ) -> Result<Self, ConfigError> {
        if window.is_zero() {
            return Err(ConfigError::InvalidWindow { provided: window });
        }
        limits.validate()?;
        Ok(Self {
            window,
            limits,
            strategy,
            cache_ttl: DEFAULT_CACHE_TTL.min(window / 2),
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        })
    }

    /// The cache TTL bounds how stale an optimistic local grant may be. It
    /// must stay below the window; zero disables the fast path.
    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Result<Self, ConfigError> {
        if cache_ttl >= self.window {
            return Err(ConfigError::InvalidCacheTtl { cache_ttl, window: self.window });
        }
        self.cache_ttl = cache_ttl;
        Ok(self)
    }

    pub fn with_lock_timing(
        mut self,
        ttl: Duration,
        wait: Duration,
        retry_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if ttl.is_zero() {
            return Err(ConfigError::InvalidLockTtl { provided: ttl });
        }
        if wait > MAX_LOCK_WAIT {
            return Err(ConfigError::InvalidLockWait { provided: wait, max: MAX_LOCK_WAIT });
        }
        if retry_interval.is_zero() {
            return Err(ConfigError::InvalidLockRetryInterval { provided: retry_interval });
        }
        self.lock_ttl = ttl;
        self.lock_wait = wait;
        self.lock_retry_interval = retry_interval;
        Ok(self)
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Result<Self, ConfigError> {
        if store_timeout.is_zero() {
            return Err(ConfigError::InvalidStoreTimeout { provided: store_timeout });
        }
        self.store_timeout = store_timeout;
        Ok(self)
    }

    fn lock_attempts(&self) -> u32 {
        let wait = self.lock_wait.as_millis();
        let interval = self.lock_retry_interval.as_millis().max(1);
        1 + u32::try_from(wait / interval).unwrap_or(u32::MAX)
    }
}

/// Outcome of one admission check, carrying the quota numbers callers
/// surface as `X-RateLimit-*` headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Whether this request may proceed.
    pub admitted: bool,
    /// Units left in the window after this decision.
    pub remaining: u32,
    /// Configured maximum for the caller's class.
    pub limit: u32,
    /// When the window resets, in epoch milliseconds.
    pub reset_at_millis: u64,
    /// Wait before retrying; zero when admitted.
    pub retry_after: Duration,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        self.admitted
    }
}

/// Per-key admission over a shared store, fronted by a sharded local cache.
///
/// Cloning is cheap and clones share all state, so one limiter can serve
/// every request task in a gateway instance.
#[derive(Debug)]
pub struct RateLimiter<S, L> {
    config: QuotaConfig,
    limits: DynamicConfig<QuotaLimits>,
    store: Arc<S>,
    lock: Arc<L>,
    cache: Arc<QuotaCache>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    shut_down: Arc<AtomicBool>,
}

impl<S, L> Clone for RateLimiter<S, L> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            limits: self.limits.clone(),
            store: self.store.clone(),
            lock: self.lock.clone(),
            cache: self.cache.clone(),
            clock: self.clock.clone(),
            sleeper: self.sleeper.clone(),
            shut_down: self.shut_down.clone(),
        }
    }
}

impl<S, L> RateLimiter<S, L>
where
    S: CounterStore,
    L: DistributedLock,
{
    /// Limiter over the given backends, on the system clock and tokio timer.
    pub fn new(config: QuotaConfig, store: S, lock: L) -> Self {
        Self::with_clock_and_sleeper(
            config,
            store,
            lock,
            Arc::new(SystemClock),
            Arc::new(TokioSleeper),
        )
    }

    /// Full-control constructor; tests inject manual clocks and sleepers.
    pub fn with_clock_and_sleeper(
        config: QuotaConfig,
        store: S,
        lock: L,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let cache = Arc::new(QuotaCache::new(config.cache_ttl, clock.clone()));
        let limits = DynamicConfig::new(config.limits);
        Self {
            config,
            limits,
            store: Arc::new(store),
            lock: Arc::new(lock),
            cache,
            clock,
            sleeper,
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Current per-class limits.
    pub fn limits(&self) -> QuotaLimits {
        *self.limits.get()
    }

    /// Retune the per-class limits in place. Takes effect immediately on the
    /// authoritative path; cached entries keep the old limit until they go
    /// stale, at most `cache_ttl` later.
    pub fn set_limits(&self, limits: QuotaLimits) -> Result<(), ConfigError> {
        limits.validate()?;
        self.limits.set(limits);
        info!(
            authenticated = limits.authenticated,
            anonymous = limits.anonymous,
            "quota limits updated"
        );
        Ok(())
    }

    /// Decide admission for one request, consuming one unit when admitted.
    ///
    /// Denial is a successful decision (`admitted == false`), not an error.
    /// Errors mean no decision could be made: lock contention, store
    /// trouble, or a limiter already shut down. Callers map those to
    /// 503-class responses, never to 429.
    pub async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        is_authenticated: bool,
    ) -> Result<Admission, AdmissionError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(AdmissionError::StoreUnavailable {
                detail: "rate limiter is shut down".into(),
            });
        }

        if let Some(admission) = self.cache.admit_fast(key.as_str()) {
            debug!(key = %key, remaining = admission.remaining, "admitted from local cache");
            self.cache.maybe_sweep();
            return Ok(admission);
        }

        let token = self.acquire_lock(key).await?;
        let limit = self.limits.get().for_class(is_authenticated);
        let outcome = self.advance_authoritative(key, limit).await;
        self.release_lock(key, &token).await;
        let admission = outcome?;

        self.cache.store(key.as_str(), &admission);
        self.cache.maybe_sweep();
        debug!(
            key = %key,
            admitted = admission.admitted,
            remaining = admission.remaining,
            "admission decided"
        );
        Ok(admission)
    }

    /// Clear a key's authoritative and local state. Repeating a reset leaves
    /// the same clean state behind.
    pub async fn reset(&self, key: &RateLimitKey) -> Result<(), AdmissionError> {
        let token = self.acquire_lock(key).await?;
        self.cache.remove(key.as_str());
        let outcome = self.store_op(self.store.remove(key.as_str())).await;
        self.release_lock(key, &token).await;
        outcome?;
        info!(key = %key, "rate limit state reset");
        Ok(())
    }

    /// Drop local state and release the store connection. Idempotent; checks
    /// after shutdown fail with [`AdmissionError::StoreUnavailable`].
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cache.clear();
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "counter store close failed");
        }
        info!("rate limiter shut down");
    }

    async fn acquire_lock(&self, key: &RateLimitKey) -> Result<LockToken, AdmissionError> {
        let attempts = self.config.lock_attempts();
        for attempt in 0..attempts {
            let acquired = timeout(
                self.config.store_timeout,
                self.lock.try_acquire(key.as_str(), self.config.lock_ttl),
            )
            .await
            .map_err(|_| AdmissionError::StoreUnavailable {
                detail: format!(
                    "lock acquisition timed out after {:?}",
                    self.config.store_timeout
                ),
            })?
            .map_err(|e| AdmissionError::StoreUnavailable { detail: e.to_string() })?;

            if let Some(token) = acquired {
                return Ok(token);
            }
            if attempt + 1 < attempts {
                self.sleeper.sleep(self.config.lock_retry_interval).await;
            }
        }
        warn!(key = %key, wait = ?self.config.lock_wait, "lock contended past the bounded wait");
        Err(AdmissionError::LockContended { key: key.to_string() })
    }

    async fn advance_authoritative(
        &self,
        key: &RateLimitKey,
        limit: u32,
    ) -> Result<Admission, AdmissionError> {
        // Units granted locally since the last sync reach the store here,
        // together with the current request.
        let pending = self.cache.drain_pending(key.as_str());
        let units = pending.saturating_add(1);

        let prior = self.store_op(self.store.read(key.as_str())).await?;
        let now = self.clock.now_millis();
        let advance = self.config.strategy.advance(prior, now, self.config.window, limit, units);
        self.store_op(self.store.write(key.as_str(), advance.state, self.config.window))
            .await?;

        Ok(Admission {
            admitted: advance.admitted,
            remaining: advance.remaining,
            limit,
            reset_at_millis: advance.reset_at_millis,
            retry_after: advance.retry_after,
        })
    }

    async fn release_lock(&self, key: &RateLimitKey, token: &LockToken) {
        // The lock TTL is the backstop if release fails; the key stays
        // blocked at most that long.
        match timeout(self.config.store_timeout, self.lock.release(key.as_str(), token)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => warn!(key = %key, "lock expired before release"),
            Ok(Err(e)) => warn!(key = %key, error = %e, "lock release failed"),
            Err(_) => warn!(key = %key, "lock release timed out"),
        }
    }

    async fn store_op<T>(
        &self,
        op: impl Future<Output = Result<T, S::Error>>,
    ) -> Result<T, AdmissionError> {
        match timeout(self.config.store_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(AdmissionError::StoreUnavailable { detail: e.to_string() }),
            Err(_) => Err(AdmissionError::StoreUnavailable {
                detail: format!("store operation timed out after {:?}", self.config.store_timeout),
            }),
        }
    }
}
