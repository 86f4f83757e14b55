//! Distributed mutual exclusion for per-key counter updates.
//!
//! One lock per quota key serializes the read-modify-write of authoritative
//! state across gateway instances. Acquisition is conditional and never
//! waits; pacing between attempts belongs to the caller. Every lock carries
//! a TTL so a crashed holder cannot deadlock the key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};

/// Proof of lock ownership. Release succeeds only with the token handed out
/// at acquisition, so an expired holder cannot free a successor's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Conditional, TTL-bounded lock over a shared keyspace.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Try to take the lock once. `None` means another holder has it.
    async fn try_acquire(&self, key: &str, ttl: Duration)
        -> Result<Option<LockToken>, Self::Error>;

    /// Release if `token` still owns the lock. `false` means the lock had
    /// already expired or changed hands.
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, Self::Error>;
}

/// In-process lock for tests and single-instance deployments. Clones share
/// the same lock table.
#[derive(Debug, Clone)]
pub struct InMemoryLock {
    holders: Arc<Mutex<HashMap<String, Holder>>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
struct Holder {
    token: LockToken,
    expires_at_millis: u64,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { holders: Arc::new(Mutex::new(HashMap::new())), clock }
    }
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    type Error = std::convert::Infallible;

    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, Self::Error> {
        let now = self.clock.now_millis();
        let mut holders = self.holders.lock().unwrap();
        if let Some(holder) = holders.get(key) {
            if holder.expires_at_millis > now {
                return Ok(None);
            }
        }
        let token = LockToken::generate();
        let expires_at_millis =
            now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        holders.insert(key.to_string(), Holder { token: token.clone(), expires_at_millis });
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, Self::Error> {
        let mut holders = self.holders.lock().unwrap();
        match holders.get(key) {
            Some(holder) if holder.token == *token => {
                holders.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
