//! One circuit breaker per downstream service, created on first use.
//!
//! The proxy asks the registry for a breaker by service name on every
//! forwarded request; the first request for a service creates the breaker,
//! every later request shares it. The registry is also the administrative
//! surface: reset a breaker by name, or snapshot all of them for
//! introspection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState, PerformanceMetrics};

/// Lookup failures from administrative registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no circuit breaker registered for service '{service}'")]
    NotFound { service: String },
}

/// One registry entry as seen by [`BreakerRegistry::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub metrics: PerformanceMetrics,
}

/// Shared map of service name to [`CircuitBreaker`].
///
/// Clones share the same map. Breakers created through
/// [`get_or_create`](Self::get_or_create) use the registry's default
/// config; services needing different thresholds get an explicitly built
/// breaker via [`insert`](Self::insert).
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    inner: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl BreakerRegistry {
    /// Registry whose first-use breakers are built from `default_config`.
    pub fn new(default_config: BreakerConfig) -> Self {
        Self { default_config, inner: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Breaker for `service`, creating it on first use.
    pub fn get_or_create(&self, service: &str) -> CircuitBreaker {
        if let Some(breaker) =
            self.inner.read().expect("breaker registry poisoned").get(service)
        {
            return breaker.clone();
        }
        let mut map = self.inner.write().expect("breaker registry poisoned");
        map.entry(service.to_string())
            .or_insert_with(|| {
                debug!(target: "tollgate::circuit_breaker_registry", service = %service, "circuit breaker created");
                CircuitBreaker::new(service, self.default_config.clone())
            })
            .clone()
    }

    /// Breaker for `service` if one exists.
    pub fn get(&self, service: &str) -> Option<CircuitBreaker> {
        self.inner.read().expect("breaker registry poisoned").get(service).cloned()
    }

    /// Register `breaker` under its own service name, replacing any
    /// existing entry. Last registration wins; entries are replaced, never
    /// merged.
    pub fn insert(&self, breaker: CircuitBreaker) {
        let service = breaker.service().to_string();
        let mut map = self.inner.write().expect("breaker registry poisoned");
        if map.contains_key(&service) {
            warn!(target: "tollgate::circuit_breaker_registry", service = %service, "circuit breaker replaced; last registration wins");
        }
        map.insert(service, breaker);
    }

    /// Force the named breaker Closed.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] when no breaker exists for `service`.
    pub fn reset(&self, service: &str) -> Result<(), RegistryError> {
        match self.inner.read().expect("breaker registry poisoned").get(service) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { service: service.to_string() }),
        }
    }

    /// Snapshot every breaker, sorted by service name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let map = self.inner.read().expect("breaker registry poisoned");
        let mut entries: Vec<BreakerSnapshot> = map
            .values()
            .map(|breaker| BreakerSnapshot {
                service: breaker.service().to_string(),
                state: breaker.state(),
                metrics: breaker.metrics(),
            })
            .collect();
        entries.sort_by(|a, b| a.service.cmp(&b.service));
        entries
    }
}
