//! Error taxonomy for the admission-control layer.
//!
//! The split mirrors how callers must react: `RateLimited` means "wait and
//! retry" (429-class), `LockContended` and `StoreUnavailable` mean "transient
//! infrastructure trouble, retry soon" (503-class), `CircuitOpen` means "the
//! downstream is being isolated" (503-class), `Downstream` wraps the guarded
//! call's own failure (502-class), and `Config` is fatal at construction
//! time. Only [`ServiceProxy`](crate::proxy::ServiceProxy) translates these
//! into caller-facing responses.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Unified error type for admission decisions and guarded execution.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionError {
    /// The per-key quota is exhausted for the current window.
    #[error("rate limit exceeded ({limit} per {window:?}); retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        limit: u32,
        window: Duration,
    },

    /// The distributed lock for the key could not be acquired within the
    /// bounded wait. Transient contention, not a quota decision.
    #[error("admission lock contended for key {key:?}")]
    LockContended { key: String },

    /// The shared counter store failed or timed out.
    #[error("shared counter store unavailable: {detail}")]
    StoreUnavailable { detail: String },

    /// The circuit breaker is rejecting calls to the service.
    #[error("circuit open for {service:?}; retry after {retry_after:?}")]
    CircuitOpen {
        service: String,
        retry_after: Duration,
    },

    /// The guarded downstream call itself failed.
    #[error(transparent)]
    Downstream(#[from] DownstreamError),

    /// Invalid configuration, surfaced at construction time only.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AdmissionError {
    /// True when the caller can expect a later retry to succeed without
    /// operator intervention. Everything except configuration errors.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }

    /// Check if this error is a quota denial.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error is lock contention.
    pub fn is_lock_contended(&self) -> bool {
        matches!(self, Self::LockContended { .. })
    }

    /// Check if this error is a circuit-breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error wraps a downstream failure.
    pub fn is_downstream(&self) -> bool {
        matches!(self, Self::Downstream(_))
    }

    /// Retry hint, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Borrow the wrapped downstream error, if present.
    pub fn as_downstream(&self) -> Option<&DownstreamError> {
        match self {
            Self::Downstream(e) => Some(e),
            _ => None,
        }
    }
}

/// Failure of the guarded downstream call. Every variant counts against the
/// service's circuit breaker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DownstreamError {
    /// The connection could not be established or broke mid-flight.
    #[error("connection to {service:?} failed: {detail}")]
    Connect { service: String, detail: String },

    /// The call exceeded the configured downstream timeout.
    #[error("call to {service:?} timed out after {elapsed:?} (limit {limit:?})")]
    Timeout {
        service: String,
        elapsed: Duration,
        limit: Duration,
    },

    /// The downstream answered outside the 2xx range.
    #[error("{service:?} returned status {status}")]
    Status { service: String, status: StatusCode },
}

impl DownstreamError {
    /// Name of the service the call targeted.
    pub fn service(&self) -> &str {
        match self {
            Self::Connect { service, .. }
            | Self::Timeout { service, .. }
            | Self::Status { service, .. } => service,
        }
    }

    /// Check if this failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The rejected status, when the downstream answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
