//! Sharded local quota cache.
//!
//! The fast path grants from a short-TTL local copy of each key's quota and
//! records every grant in the entry. The authoritative path drains those
//! recorded grants under the key's distributed lock and folds them into the
//! shared counter, so local grants are never lost and never double-counted.
//! Sixteen shards keep hot keys from serializing behind one mutex.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{rng, Rng};

use super::Admission;
use crate::clock::Clock;

const SHARD_COUNT: usize = 16;
const DEFAULT_MAX_ENTRIES_PER_SHARD: usize = 4096;
/// Roughly one call in this many triggers an expiry sweep of one shard.
const SWEEP_INTERVAL: u32 = 64;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    remaining: u32,
    limit: u32,
    reset_at_millis: u64,
    stored_at_millis: u64,
    /// Units granted from this entry since the last authoritative sync.
    granted_locally: u32,
}

#[derive(Debug)]
pub(crate) struct QuotaCache {
    shards: Vec<Mutex<HashMap<String, CacheEntry>>>,
    ttl_millis: u64,
    max_per_shard: usize,
    clock: Arc<dyn Clock>,
}

impl QuotaCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(ttl, clock, DEFAULT_MAX_ENTRIES_PER_SHARD)
    }

    pub fn with_capacity(ttl: Duration, clock: Arc<dyn Clock>, max_per_shard: usize) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            ttl_millis: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            max_per_shard,
            clock,
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Entries go stale at their TTL, and at the window end even if the TTL
    /// has not lapsed yet.
    fn is_fresh(&self, entry: &CacheEntry, now_millis: u64) -> bool {
        now_millis.saturating_sub(entry.stored_at_millis) < self.ttl_millis
            && now_millis < entry.reset_at_millis
    }

    /// Grant from the local copy when it is fresh and has quota left.
    /// Exhausted or stale entries return `None`: denial is never decided
    /// here, only by the authoritative store.
    pub fn admit_fast(&self, key: &str) -> Option<Admission> {
        if self.ttl_millis == 0 {
            return None;
        }
        let now = self.clock.now_millis();
        let mut shard = self.shard(key).lock().unwrap();
        let entry = shard.get_mut(key)?;
        if !self.is_fresh(entry, now) || entry.remaining == 0 {
            // Left in place: any recorded grants still have to reach the
            // store via drain_pending.
            return None;
        }
        entry.remaining -= 1;
        entry.granted_locally += 1;
        Some(Admission {
            admitted: true,
            remaining: entry.remaining,
            limit: entry.limit,
            reset_at_millis: entry.reset_at_millis,
            retry_after: Duration::ZERO,
        })
    }

    /// Remove the key's entry and return how many units it granted since the
    /// last sync. Called with the key's distributed lock held; the entry
    /// stays absent until [`QuotaCache::store`] reinstalls a fresh one, so no
    /// grant can slip between drain and reinstall.
    pub fn drain_pending(&self, key: &str) -> u32 {
        self.shard(key).lock().unwrap().remove(key).map_or(0, |e| e.granted_locally)
    }

    /// Install a fresh entry from an authoritative result. Exhausted results
    /// are not cached, and a full shard drops new keys rather than evicting.
    pub fn store(&self, key: &str, admission: &Admission) {
        if self.ttl_millis == 0 || admission.remaining == 0 {
            return;
        }
        let now = self.clock.now_millis();
        let mut shard = self.shard(key).lock().unwrap();
        if shard.len() >= self.max_per_shard && !shard.contains_key(key) {
            return;
        }
        shard.insert(
            key.to_string(),
            CacheEntry {
                remaining: admission.remaining,
                limit: admission.limit,
                reset_at_millis: admission.reset_at_millis,
                stored_at_millis: now,
                granted_locally: 0,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.shard(key).lock().unwrap().remove(key);
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().unwrap().clear();
        }
    }

    /// Probabilistic housekeeping on the caller's thread: roughly one call in
    /// [`SWEEP_INTERVAL`] sweeps one random shard. Entries with unreconciled
    /// grants survive the sweep; their units still owe a sync.
    pub fn maybe_sweep(&self) {
        let mut rng = rng();
        if rng.random_range(0..SWEEP_INTERVAL) != 0 {
            return;
        }
        let index = rng.random_range(0..SHARD_COUNT);
        self.sweep_shard(index, self.clock.now_millis());
    }

    fn sweep_shard(&self, index: usize, now_millis: u64) {
        self.shards[index]
            .lock()
            .unwrap()
            .retain(|_, entry| self.is_fresh(entry, now_millis) || entry.granted_locally > 0);
    }

    #[cfg(test)]
    pub fn sweep_all(&self) {
        let now = self.clock.now_millis();
        for index in 0..SHARD_COUNT {
            self.sweep_shard(index, now);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }
}
