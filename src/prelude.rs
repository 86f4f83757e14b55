//! Convenient re-exports for the common tollgate surface.
pub use crate::{
    circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState, PerformanceMetrics},
    circuit_breaker_registry::{BreakerRegistry, BreakerSnapshot, RegistryError},
    config::{AdmissionConfig, ConfigError},
    error::{AdmissionError, DownstreamError},
    identity::{RateLimitKey, RequestIdentity},
    proxy::{
        Downstream, DownstreamTarget, GatewayResponse, HttpDownstream, InboundRequest,
        ServiceProxy,
    },
    rate_limit::{
        Admission, AdmissionLayer, CounterStore, DistributedLock, InMemoryLock, InMemoryStore,
        QuotaConfig, QuotaLimits, RateLimiter, Strategy,
    },
};

#[cfg(feature = "redis-backend")]
pub use crate::rate_limit::{RedisLock, RedisStore};
