//! Configuration aggregate and validation errors.
//!
//! All limits, windows, and timeouts are validated when a config value is
//! constructed. A bad threshold fails at startup with a [`ConfigError`],
//! never at request time. Component-specific configs live next to their
//! components ([`QuotaConfig`](crate::rate_limit::QuotaConfig),
//! [`BreakerConfig`](crate::circuit_breaker::BreakerConfig)); this module
//! holds the shared error type and the per-route aggregate.

use std::time::Duration;

use thiserror::Error;

use crate::circuit_breaker::BreakerConfig;
use crate::rate_limit::QuotaConfig;

/// Upper bound on the distributed-lock wait. An unbounded wait here would
/// turn lock contention into a denial-of-service vector.
pub const MAX_LOCK_WAIT: Duration = Duration::from_secs(1);

/// Rejected configuration values. Each variant names the offending field and
/// echoes what was provided.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("window duration must be positive (got {provided:?})")]
    InvalidWindow { provided: Duration },

    #[error("request limit must be at least 1 (got {provided})")]
    InvalidLimit { provided: u32 },

    #[error("cache TTL {cache_ttl:?} must be shorter than the window {window:?}")]
    InvalidCacheTtl { cache_ttl: Duration, window: Duration },

    #[error("lock TTL must be positive (got {provided:?})")]
    InvalidLockTtl { provided: Duration },

    #[error("lock wait must stay within {max:?} (got {provided:?})")]
    InvalidLockWait { provided: Duration, max: Duration },

    #[error("lock retry interval must be positive (got {provided:?})")]
    InvalidLockRetryInterval { provided: Duration },

    #[error("store timeout must be positive (got {provided:?})")]
    InvalidStoreTimeout { provided: Duration },

    #[error("failure threshold must be at least 1 (got {provided})")]
    InvalidFailureThreshold { provided: u32 },

    #[error("reset timeout must be positive (got {provided:?})")]
    InvalidResetTimeout { provided: Duration },

    #[error("half-open timeout must be positive (got {provided:?})")]
    InvalidHalfOpenTimeout { provided: Duration },

    #[error("downstream timeout must be positive (got {provided:?})")]
    InvalidDownstreamTimeout { provided: Duration },

    #[error("environment name must not be empty")]
    EmptyEnvironment,
}

/// Everything one route needs: quota rules, breaker thresholds, the
/// downstream call timeout, and the environment prefix for key derivation.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub environment: String,
    pub quota: QuotaConfig,
    pub breaker: BreakerConfig,
    pub downstream_timeout: Duration,
}

impl AdmissionConfig {
    pub fn new(
        environment: impl Into<String>,
        quota: QuotaConfig,
        breaker: BreakerConfig,
        downstream_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let environment = environment.into();
        if environment.is_empty() {
            return Err(ConfigError::EmptyEnvironment);
        }
        if downstream_timeout.is_zero() {
            return Err(ConfigError::InvalidDownstreamTimeout { provided: downstream_timeout });
        }
        Ok(Self { environment, quota, breaker, downstream_timeout })
    }
}
