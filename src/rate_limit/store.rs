//! Authoritative counter storage.
//!
//! The store holds the cross-instance source of truth for every quota key.
//! Callers mutate it only while holding the key's distributed lock, so the
//! interface is a plain read/overwrite pair rather than compare-and-set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};

/// One key's stored counter: consumed units and the window origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub count: u32,
    pub window_start_millis: u64,
}

/// Storage backend for authoritative window state.
///
/// Implementations must honor per-key TTLs so abandoned keys self-expire;
/// the TTL on every write equals the quota window.
#[async_trait]
pub trait CounterStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Current state for a key. `None` when absent or expired.
    async fn read(&self, key: &str) -> Result<Option<WindowState>, Self::Error>;

    /// Overwrite a key's state and refresh its TTL.
    async fn write(&self, key: &str, state: WindowState, ttl: Duration)
        -> Result<(), Self::Error>;

    /// Delete a key's state. Deleting an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<(), Self::Error>;

    /// Release held connections. Backends without connections keep the
    /// default no-op.
    async fn close(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// In-process store for tests and single-instance deployments.
///
/// Clones share the same map, so several limiter instances in one test can
/// model several gateway processes sharing one external store.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    entries: Arc<Mutex<HashMap<String, StoredEntry>>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy)]
struct StoredEntry {
    state: WindowState,
    expires_at_millis: u64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    /// Number of live (unexpired) keys. Test hook.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries.lock().unwrap().values().filter(|e| e.expires_at_millis > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    type Error = std::convert::Infallible;

    async fn read(&self, key: &str) -> Result<Option<WindowState>, Self::Error> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at_millis > now => Ok(Some(entry.state)),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        key: &str,
        state: WindowState,
        ttl: Duration,
    ) -> Result<(), Self::Error> {
        let expires_at_millis = self
            .clock
            .now_millis()
            .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), StoredEntry { state, expires_at_millis });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Self::Error> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
