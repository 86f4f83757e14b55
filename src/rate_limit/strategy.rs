//! Window math for the two quota strategies.
//!
//! Pure functions over `(prior state, now, window, limit)`. The limiter calls
//! these under the per-key distributed lock and writes the returned state
//! back, so nothing here needs interior mutability or I/O.

use std::time::Duration;

use super::store::WindowState;

/// How consumed quota returns to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Fixed window: the full quota becomes available again when the window
    /// rolls over.
    TokenBucket,
    /// Continuous drain: consumed units leak back at `limit / window`.
    LeakyBucket,
}

/// Outcome of advancing a counter by one request plus any locally granted
/// units that have not reached the store yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Advance {
    /// State to write back (also written on denial, to refresh the TTL).
    pub state: WindowState,
    /// Whether the current request got its unit.
    pub admitted: bool,
    pub remaining: u32,
    pub reset_at_millis: u64,
    /// Zero when admitted; time until a unit frees up otherwise.
    pub retry_after: Duration,
}

impl Strategy {
    /// Advance the counter by `units` (the current request plus previously
    /// cache-granted units being reconciled). Admission refers to the current
    /// request only; reconciled units are already-spent history and count
    /// against the window even when the current request is denied.
    pub(crate) fn advance(
        self,
        prior: Option<WindowState>,
        now_millis: u64,
        window: Duration,
        limit: u32,
        units: u32,
    ) -> Advance {
        let window_millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
        match self {
            Strategy::TokenBucket => {
                token_bucket(prior, now_millis, window_millis, limit, units)
            }
            Strategy::LeakyBucket => {
                leaky_bucket(prior, now_millis, window_millis, limit, units)
            }
        }
    }
}

fn token_bucket(
    prior: Option<WindowState>,
    now_millis: u64,
    window_millis: u64,
    limit: u32,
    units: u32,
) -> Advance {
    // A prior window start in the future means another instance wrote with a
    // faster wall clock; treat that as "window just started".
    let (pre, window_start) = match prior {
        Some(state) if now_millis.saturating_sub(state.window_start_millis) < window_millis => {
            (state.count, state.window_start_millis)
        }
        // Absent, expired, or rolled over: fresh window. Units granted
        // against a closed window are history and do not carry forward.
        _ => return fresh_window(now_millis, window_millis, limit),
    };

    let consumed = pre.saturating_add(units);
    let admitted = consumed <= limit;
    let count = consumed.min(limit);
    let reset_at_millis = window_start.saturating_add(window_millis);
    Advance {
        state: WindowState { count, window_start_millis: window_start },
        admitted,
        remaining: limit - count,
        reset_at_millis,
        retry_after: if admitted {
            Duration::ZERO
        } else {
            millis_until(now_millis, reset_at_millis)
        },
    }
}

fn leaky_bucket(
    prior: Option<WindowState>,
    now_millis: u64,
    window_millis: u64,
    limit: u32,
    units: u32,
) -> Advance {
    let Some(state) = prior else {
        return fresh_window(now_millis, window_millis, limit);
    };

    let elapsed = now_millis.saturating_sub(state.window_start_millis);
    // u128 intermediates: elapsed * limit overflows u64 for wide windows.
    let leaked = (u128::from(elapsed) * u128::from(limit) / u128::from(window_millis))
        .min(u128::from(state.count)) as u32;

    let (level, window_start) = if leaked >= state.count {
        // Fully drained; the leak origin restarts at the present.
        (0, now_millis)
    } else {
        // Advance the origin by exactly the drained time so repeated calls
        // within one unit-time never leak the same units twice.
        let drained_millis =
            (u128::from(leaked) * u128::from(window_millis) / u128::from(limit)) as u64;
        (state.count - leaked, state.window_start_millis.saturating_add(drained_millis))
    };

    let consumed = level.saturating_add(units);
    let admitted = consumed <= limit;
    let count = consumed.min(limit);
    let reset_at_millis = window_start.saturating_add(window_millis);
    Advance {
        state: WindowState { count, window_start_millis: window_start },
        admitted,
        remaining: limit - count,
        reset_at_millis,
        retry_after: if admitted {
            Duration::ZERO
        } else {
            // One unit leaks every window/limit. window_start marks the last
            // leak, so the next unit frees one unit-time after it.
            let unit_millis = (window_millis / u64::from(limit)).max(1);
            millis_until(now_millis, window_start.saturating_add(unit_millis))
        },
    }
}

fn fresh_window(now_millis: u64, window_millis: u64, limit: u32) -> Advance {
    Advance {
        state: WindowState { count: 1, window_start_millis: now_millis },
        admitted: true,
        remaining: limit.saturating_sub(1),
        reset_at_millis: now_millis.saturating_add(window_millis),
        retry_after: Duration::ZERO,
    }
}

fn millis_until(now_millis: u64, at_millis: u64) -> Duration {
    Duration::from_millis(at_millis.saturating_sub(now_millis).max(1))
}
