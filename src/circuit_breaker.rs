//! Per-service circuit breaker with timer-driven recovery.
//!
//! One breaker guards one downstream service inside one gateway process.
//! State is deliberately not shared across instances: each gateway isolates
//! a failing downstream on its own evidence, trading global consistency for
//! availability.
//!
//! Transitions out of Open and HalfOpen are driven by spawned timer tasks,
//! not by lazy checks on the next call, so an idle service still recovers on
//! schedule. Every transition bumps a generation counter packed into the
//! state word; a timer or in-flight probe from an older generation loses its
//! compare-and-swap and becomes a no-op, which is what makes administrative
//! [`CircuitBreaker::reset`] deterministic.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::ConfigError;
use crate::error::{AdmissionError, DownstreamError};

/// Consecutive failures that trip a default-configured breaker.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Open dwell before a default-configured breaker probes again.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a default-configured breaker waits in HalfOpen for its probe.
pub const DEFAULT_HALF_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Sentinel for an unclaimed probe slot.
const PROBE_FREE: u64 = u64::MAX;

// The machine word keeps the state in its low two bits and the transition
// generation above them, so state checks and stale-generation checks are one
// compare-and-swap.
fn pack(state: u8, generation: u64) -> u64 {
    (generation << 2) | u64::from(state)
}

fn unpack(word: u64) -> (u8, u64) {
    ((word & 0b11) as u8, word >> 2)
}

/// Observable state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted.
    Closed,
    /// Calls are rejected until the reset timer fires.
    Open,
    /// One probe call is allowed to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Validated circuit-breaker thresholds and timers.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_timeout: Duration,
}

impl BreakerConfig {
    /// `failure_threshold` consecutive failures trip the breaker;
    /// `reset_timeout` is the Open dwell before probing; `half_open_timeout`
    /// bounds how long the breaker waits in HalfOpen for a probe to resolve.
    pub fn new(
        failure_threshold: u32,
        reset_timeout: Duration,
        half_open_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold { provided: failure_threshold });
        }
        if reset_timeout.is_zero() {
            return Err(ConfigError::InvalidResetTimeout { provided: reset_timeout });
        }
        if half_open_timeout.is_zero() {
            return Err(ConfigError::InvalidHalfOpenTimeout { provided: half_open_timeout });
        }
        Ok(Self { failure_threshold, reset_timeout, half_open_timeout })
    }

    /// A breaker that never trips. Calls always execute; metrics still
    /// accumulate.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: u32::MAX,
            reset_timeout: Duration::MAX,
            half_open_timeout: Duration::MAX,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    pub fn half_open_timeout(&self) -> Duration {
        self.half_open_timeout
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            half_open_timeout: DEFAULT_HALF_OPEN_TIMEOUT,
        }
    }
}

/// Snapshot of a breaker's call statistics. A copy; holding one does not
/// alias live state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    /// Calls that actually executed (rejected calls are not counted).
    pub total_calls: u64,
    pub failed_calls: u64,
    /// Failures since the last success or reset.
    pub consecutive_failures: u32,
    /// `(total - failed) / total`; `1.0` before any call.
    pub success_rate: f64,
    /// Running average over every executed call, success or failure.
    pub avg_response_millis: f64,
    pub last_failure_at_millis: Option<u64>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    total_calls: u64,
    failed_calls: u64,
    consecutive_failures: u32,
    avg_response_millis: f64,
    last_failure_at_millis: Option<u64>,
}

impl MetricsInner {
    // Called after total_calls has been incremented, so n >= 1.
    fn fold_response_time(&mut self, elapsed_millis: u64) {
        let n = self.total_calls as f64;
        self.avg_response_millis =
            (self.avg_response_millis * (n - 1.0) + elapsed_millis as f64) / n;
    }
}

#[derive(Debug)]
struct BreakerShared {
    service: String,
    config: BreakerConfig,
    machine: AtomicU64,
    opened_at_millis: AtomicU64,
    /// Generation of the in-flight probe, or [`PROBE_FREE`].
    probe_slot: AtomicU64,
    metrics: Mutex<MetricsInner>,
    /// The one pending transition timer (reset or probe-window).
    timer: Mutex<Option<AbortHandle>>,
    clock: Arc<dyn Clock>,
}

impl BreakerShared {
    fn install_timer(&self, handle: AbortHandle) {
        let mut slot = self.timer.lock().unwrap();
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn arm_reset_timer(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        let delay = self.config.reset_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.enter_half_open(generation);
            }
        })
        .abort_handle();
        self.install_timer(handle);
    }

    fn arm_probe_window_timer(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        let delay = self.config.half_open_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire_probe_window(generation);
            }
        })
        .abort_handle();
        self.install_timer(handle);
    }

    fn enter_half_open(self: &Arc<Self>, from_generation: u64) {
        let from = pack(STATE_OPEN, from_generation);
        let to = pack(STATE_HALF_OPEN, from_generation + 1);
        if self.machine.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            self.probe_slot.store(PROBE_FREE, Ordering::Release);
            info!(service = %self.service, "circuit half-open; next call probes the downstream");
            self.arm_probe_window_timer(from_generation + 1);
        }
    }

    fn expire_probe_window(self: &Arc<Self>, from_generation: u64) {
        let from = pack(STATE_HALF_OPEN, from_generation);
        let to = pack(STATE_OPEN, from_generation + 1);
        if self.machine.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            self.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
            self.probe_slot.store(PROBE_FREE, Ordering::Release);
            warn!(service = %self.service, "probe window expired without a result; circuit re-opened");
            self.arm_reset_timer(from_generation + 1);
        }
    }

    fn close_from_probe(self: &Arc<Self>, from_generation: u64) {
        let from = pack(STATE_HALF_OPEN, from_generation);
        let to = pack(STATE_CLOSED, from_generation + 1);
        if self.machine.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            self.cancel_timer();
            self.probe_slot.store(PROBE_FREE, Ordering::Release);
            info!(service = %self.service, "probe succeeded; circuit closed");
        }
    }

    fn reopen_from_probe_failure(self: &Arc<Self>, from_generation: u64) {
        let from = pack(STATE_HALF_OPEN, from_generation);
        let to = pack(STATE_OPEN, from_generation + 1);
        if self.machine.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            self.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
            self.probe_slot.store(PROBE_FREE, Ordering::Release);
            warn!(service = %self.service, "probe failed; circuit re-opened");
            self.arm_reset_timer(from_generation + 1);
        }
    }
}

impl Drop for BreakerShared {
    fn drop(&mut self) {
        if let Ok(slot) = self.timer.get_mut() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

// Frees the probe slot if the probe future is dropped before resolving, so a
// cancelled probe cannot wedge the breaker in HalfOpen.
struct ProbeGuard<'a> {
    shared: &'a BreakerShared,
    generation: u64,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        let _ = self.shared.probe_slot.compare_exchange(
            self.generation,
            PROBE_FREE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Failure-isolation state machine guarding one downstream service.
///
/// Clones share the same state through an `Arc`, so every request task in a
/// gateway observes and affects the same circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<BreakerShared>,
}

impl CircuitBreaker {
    /// Breaker for `service` on the default monotonic clock.
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(service, config, Arc::new(MonotonicClock::default()))
    }

    /// Breaker on an injected clock; tests drive latency and retry hints
    /// through it.
    pub fn with_clock(
        service: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(BreakerShared {
                service: service.into(),
                config,
                machine: AtomicU64::new(pack(STATE_CLOSED, 0)),
                opened_at_millis: AtomicU64::new(0),
                probe_slot: AtomicU64::new(PROBE_FREE),
                metrics: Mutex::new(MetricsInner::default()),
                timer: Mutex::new(None),
                clock,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.shared.service
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> CircuitState {
        match unpack(self.shared.machine.load(Ordering::Acquire)).0 {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("circuit state bits out of range"),
        }
    }

    /// Non-blocking check; true while calls are being rejected outright.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Snapshot of the call statistics.
    pub fn metrics(&self) -> PerformanceMetrics {
        let m = self.shared.metrics.lock().unwrap();
        let success_rate = if m.total_calls == 0 {
            1.0
        } else {
            (m.total_calls - m.failed_calls) as f64 / m.total_calls as f64
        };
        PerformanceMetrics {
            total_calls: m.total_calls,
            failed_calls: m.failed_calls,
            consecutive_failures: m.consecutive_failures,
            success_rate,
            avg_response_millis: m.avg_response_millis,
            last_failure_at_millis: m.last_failure_at_millis,
        }
    }

    /// Run `operation` under the breaker.
    ///
    /// Closed: the call executes; its outcome feeds the failure streak.
    /// Open: rejected immediately with [`AdmissionError::CircuitOpen`]
    /// carrying the time until the next probe. HalfOpen: exactly one caller
    /// wins the probe slot; everyone else is rejected. A probe success
    /// closes the circuit, a probe failure re-opens it.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::CircuitOpen`] when rejected without executing;
    /// [`AdmissionError::Downstream`] re-raising the operation's own failure.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, AdmissionError>
    where
        T: Send,
        Fut: Future<Output = Result<T, DownstreamError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let mut probe: Option<ProbeGuard<'_>> = None;
        loop {
            let word = self.shared.machine.load(Ordering::Acquire);
            match unpack(word) {
                (STATE_CLOSED, _) => break,
                (STATE_OPEN, _) => return Err(self.rejection()),
                (STATE_HALF_OPEN, generation) => {
                    if self
                        .shared
                        .probe_slot
                        .compare_exchange(
                            PROBE_FREE,
                            generation,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        debug!(service = %self.shared.service, "probing half-open circuit");
                        probe = Some(ProbeGuard { shared: &self.shared, generation });
                        break;
                    }
                    // Slot taken. Unless the state moved underneath us,
                    // reject; otherwise re-check.
                    if self.shared.machine.load(Ordering::Acquire) == word {
                        return Err(AdmissionError::CircuitOpen {
                            service: self.shared.service.clone(),
                            retry_after: self.shared.config.half_open_timeout,
                        });
                    }
                }
                _ => unreachable!("circuit state bits out of range"),
            }
        }

        let started = self.shared.clock.now_millis();
        let result = operation().await;
        let elapsed_millis = self.shared.clock.now_millis().saturating_sub(started);

        match (&result, probe.take()) {
            (Ok(_), Some(guard)) => {
                self.record_success(elapsed_millis);
                self.shared.close_from_probe(guard.generation);
            }
            (Ok(_), None) => self.record_success(elapsed_millis),
            (Err(_), Some(guard)) => {
                self.record_failure(elapsed_millis);
                self.shared.reopen_from_probe_failure(guard.generation);
            }
            (Err(_), None) => {
                let consecutive = self.record_failure(elapsed_millis);
                self.maybe_trip(consecutive);
            }
        }

        result.map_err(AdmissionError::from)
    }

    /// Force the breaker Closed with a fresh generation, cancelling any
    /// pending transition timer and zeroing the failure streak. Cumulative
    /// call statistics survive.
    pub fn reset(&self) {
        self.shared.cancel_timer();
        let previous = self
            .shared
            .machine
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (_, generation) = unpack(word);
                Some(pack(STATE_CLOSED, generation + 1))
            })
            .unwrap_or_else(|word| word);
        self.shared.probe_slot.store(PROBE_FREE, Ordering::Release);
        self.shared.metrics.lock().unwrap().consecutive_failures = 0;
        if unpack(previous).0 != STATE_CLOSED {
            info!(service = %self.shared.service, "circuit force-closed by administrative reset");
        }
    }

    fn rejection(&self) -> AdmissionError {
        let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
        let elapsed =
            Duration::from_millis(self.shared.clock.now_millis().saturating_sub(opened_at));
        AdmissionError::CircuitOpen {
            service: self.shared.service.clone(),
            retry_after: self.shared.config.reset_timeout.saturating_sub(elapsed),
        }
    }

    fn record_success(&self, elapsed_millis: u64) {
        let mut m = self.shared.metrics.lock().unwrap();
        m.total_calls += 1;
        m.consecutive_failures = 0;
        m.fold_response_time(elapsed_millis);
    }

    fn record_failure(&self, elapsed_millis: u64) -> u32 {
        let mut m = self.shared.metrics.lock().unwrap();
        m.total_calls += 1;
        m.failed_calls += 1;
        m.consecutive_failures = m.consecutive_failures.saturating_add(1);
        m.last_failure_at_millis = Some(self.shared.clock.now_millis());
        m.fold_response_time(elapsed_millis);
        m.consecutive_failures
    }

    fn maybe_trip(&self, consecutive: u32) {
        if consecutive < self.shared.config.failure_threshold {
            return;
        }
        let word = self.shared.machine.load(Ordering::Acquire);
        let (state, generation) = unpack(word);
        if state != STATE_CLOSED {
            return;
        }
        let to = pack(STATE_OPEN, generation + 1);
        if self.shared.machine.compare_exchange(word, to, Ordering::AcqRel, Ordering::Acquire).is_ok()
        {
            self.shared.opened_at_millis.store(self.shared.clock.now_millis(), Ordering::Release);
            self.shared.probe_slot.store(PROBE_FREE, Ordering::Release);
            tracing::error!(
                service = %self.shared.service,
                consecutive,
                threshold = self.shared.config.failure_threshold,
                "failure threshold reached; circuit opened"
            );
            self.shared.arm_reset_timer(generation + 1);
        }
    }
}
