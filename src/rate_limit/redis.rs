//! Redis-backed counter store and distributed lock.
//!
//! Window state lives in a hash per rate-limit key (`counter:{key}` with
//! `count` and `window_start` fields, PEXPIREd past the window), and the
//! per-key lock is a `lock:{key}` string written with `SET NX PX` and
//! released through a compare-and-delete script so only the holder's token
//! can free it. The two prefixes keep counters and locks from colliding in
//! a shared keyspace.
//!
//! Both types clone a [`ConnectionManager`], which multiplexes one
//! connection and reconnects on its own, so clones are cheap and every
//! gateway task can hold one.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};

use super::lock::{DistributedLock, LockToken};
use super::store::{CounterStore, WindowState};

const COUNTER_KEY_PREFIX: &str = "counter:";
const LOCK_KEY_PREFIX: &str = "lock:";
const COUNTER_FIELD_COUNT: &str = "count";
const COUNTER_FIELD_WINDOW_START: &str = "window_start";

/// Extra lifetime on counter keys so a window never expires early under
/// clock skew between gateways and the Redis server.
const TTL_GRACE: Duration = Duration::from_secs(1);

/// Deletes the lock only while it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Shared window counters in Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis at `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self, RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager, sharing it with other users.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{COUNTER_KEY_PREFIX}{key}")
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    type Error = RedisError;

    async fn read(&self, key: &str) -> Result<Option<WindowState>, Self::Error> {
        let mut conn = self.conn.clone();
        let (count, window_start): (Option<u32>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.counter_key(key))
            .arg(COUNTER_FIELD_COUNT)
            .arg(COUNTER_FIELD_WINDOW_START)
            .query_async(&mut conn)
            .await?;

        Ok(match (count, window_start) {
            (Some(count), Some(window_start_millis)) => {
                Some(WindowState { count, window_start_millis })
            }
            _ => None,
        })
    }

    async fn write(&self, key: &str, state: WindowState, ttl: Duration) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let counter_key = self.counter_key(key);
        redis::pipe()
            .hset(&counter_key, COUNTER_FIELD_COUNT, state.count)
            .hset(&counter_key, COUNTER_FIELD_WINDOW_START, state.window_start_millis)
            .pexpire(&counter_key, ttl_millis(ttl + TTL_GRACE))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.counter_key(key)).await?;
        Ok(())
    }
}

/// Per-key mutual exclusion through Redis.
///
/// `try_acquire` is single-winner: `SET NX` admits exactly one holder until
/// the token expires or is released. A holder that outlives its TTL loses
/// the lock; its later release returns `false` instead of freeing someone
/// else's acquisition.
#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
}

impl RedisLock {
    pub async fn connect(redis_url: &str) -> Result<Self, RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{LOCK_KEY_PREFIX}{key}")
    }
}

impl fmt::Debug for RedisLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLock").finish_non_exhaustive()
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    type Error = RedisError;

    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, Self::Error> {
        let mut conn = self.conn.clone();
        let token = LockToken::generate();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(outcome.map(|_| token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let released: i64 = Script::new(RELEASE_SCRIPT)
            .key(self.lock_key(key))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }
}
