#![forbid(unsafe_code)]

//! # Tollgate
//!
//! Admission control for request gateways: decide whether a request may
//! proceed before committing resources to it, and isolate the downstreams
//! that stop answering.
//!
//! ## Features
//!
//! - **Distributed rate limiting** with token-bucket and leaky-bucket
//!   strategies over a shared counter store, fronted by a bounded local
//!   cache for sub-millisecond repeat decisions
//! - **Circuit breakers** with timer-driven recovery, one per downstream
//!   service, plus a registry for administrative reset and introspection
//! - **Guarded proxying** that normalizes denials, open circuits, and
//!   downstream failures into clean HTTP-shaped responses with retry hints
//! - **Tower middleware** for embedding admission in any service stack
//! - **Swappable backends**: in-memory for tests and single instances,
//!   Redis (`redis-backend` feature) for fleets
//!
//! ## Quick Start
//!
//! ```rust
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::time::Duration;
//! use tollgate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AdmissionError> {
//!     let quota = QuotaConfig::new(
//!         Duration::from_secs(60),
//!         QuotaLimits { authenticated: 100, anonymous: 20 },
//!         Strategy::TokenBucket,
//!     )?;
//!     let limiter = RateLimiter::new(quota, InMemoryStore::new(), InMemoryLock::new());
//!
//!     let identity = RequestIdentity::authenticated("u-1", IpAddr::V4(Ipv4Addr::LOCALHOST));
//!     let key = RateLimitKey::derive("prod", &identity);
//!     let admission = limiter.check_and_consume(&key, identity.is_authenticated()).await?;
//!     assert!(admission.is_admitted());
//!     Ok(())
//! }
//! ```

pub mod adaptive;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod prelude;
pub mod proxy;
pub mod rate_limit;
pub mod sleeper;

// Re-exports
pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState, PerformanceMetrics};
pub use circuit_breaker_registry::{BreakerRegistry, BreakerSnapshot};
pub use clock::{Clock, MonotonicClock, SystemClock};
pub use config::{AdmissionConfig, ConfigError};
pub use error::{AdmissionError, DownstreamError};
pub use identity::{RateLimitKey, RequestIdentity};
pub use proxy::{DownstreamTarget, GatewayResponse, InboundRequest, ServiceProxy};
pub use rate_limit::{Admission, QuotaConfig, QuotaLimits, RateLimiter, Strategy};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
