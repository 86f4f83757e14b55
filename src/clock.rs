//! Clock abstractions so every time-dependent admission decision can be
//! driven by a fake clock in tests.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Source of "now" in milliseconds.
///
/// The rate limiter needs wall-clock time (window state is shared across
/// gateway instances through the external store), while the circuit breaker
/// only needs elapsed time within one process. Both take the same trait so
/// tests can drive either with a manual clock.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Wall clock reporting milliseconds since the Unix epoch.
///
/// This is the default for rate limiting: `windowStart` values written to the
/// shared store must mean the same thing to every gateway instance.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Monotonic clock backed by `Instant::now()`.
///
/// Default for the circuit breaker: state transitions only compare durations
/// within one process, and a monotonic source cannot jump backwards under
/// NTP adjustments. Resets when the process restarts.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Hand-driven clock for tests that need to cross window or TTL
    /// boundaries without sleeping.
    #[derive(Debug, Clone, Default)]
    pub struct ManualClock {
        millis: Arc<AtomicU64>,
    }

    impl ManualClock {
        pub fn new(start_millis: u64) -> Self {
            Self { millis: Arc::new(AtomicU64::new(start_millis)) }
        }

        pub fn advance(&self, delta: Duration) {
            self.millis.fetch_add(
                u64::try_from(delta.as_millis()).unwrap_or(u64::MAX),
                Ordering::SeqCst,
            );
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.millis.load(Ordering::SeqCst)
        }
    }
}
