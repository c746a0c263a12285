//! Compact monotonic time utilities.
//!
//! Uses a process-local monotonic clock so timestamps fit in a `u64`
//! (8 bytes vs 16 for `Option<Instant>`). The periodic driver also
//! maintains a cached tick timestamp so hot paths can read "now" without
//! a syscall.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Returns current monotonic time in milliseconds since process start.
#[inline]
pub fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Sentinel value meaning "no expiry".
pub const NO_EXPIRY: u64 = 0;

/// Returns true if the given expiry timestamp has passed.
#[inline]
pub fn is_expired(expires_at_ms: u64) -> bool {
    expires_at_ms != NO_EXPIRY && now_ms() >= expires_at_ms
}

/// Converts a Duration to an absolute expiry timestamp.
#[inline]
pub fn expiry_from_duration(ttl: Option<std::time::Duration>) -> u64 {
    ttl.map(|d| now_ms() + d.as_millis() as u64)
        .unwrap_or(NO_EXPIRY)
}

/// Returns remaining TTL in milliseconds, or None if no expiry.
#[inline]
pub fn remaining_ms(expires_at_ms: u64) -> Option<u64> {
    if expires_at_ms == NO_EXPIRY {
        None
    } else {
        Some(expires_at_ms.saturating_sub(now_ms()))
    }
}

/// A timestamp refreshed once per driver tick. Cheap to read from any
/// thread; precision is bounded by the tick rate, which is fine for
/// LRU/LFU accounting and period checks.
#[derive(Debug, Default)]
pub struct CachedClock {
    ms: AtomicU64,
}

impl CachedClock {
    pub fn new() -> Self {
        let clock = Self::default();
        clock.refresh();
        clock
    }

    /// Re-reads the monotonic clock. Called by the driver each tick.
    pub fn refresh(&self) -> u64 {
        let now = now_ms();
        self.ms.store(now, Ordering::Relaxed);
        now
    }

    /// The timestamp of the most recent refresh.
    #[inline]
    pub fn cached_ms(&self) -> u64 {
        self.ms.load(Ordering::Relaxed)
    }
}

/// Returns `true` when at least `period_ms` has elapsed since `*last_ms`,
/// updating `*last_ms` to `now_ms` in that case. Drives "every N ms"
/// work inside the periodic tick.
pub fn run_with_period(last_ms: &mut u64, now_ms: u64, period_ms: u64) -> bool {
    if now_ms.saturating_sub(*last_ms) >= period_ms {
        *last_ms = now_ms;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn no_expiry_never_expires() {
        assert!(!is_expired(NO_EXPIRY));
    }

    #[test]
    fn past_timestamp_is_expired() {
        // force the clock to have a nonzero reading first
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(is_expired(1));
    }

    #[test]
    fn cached_clock_tracks_refresh() {
        let clock = CachedClock::new();
        let first = clock.cached_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(clock.cached_ms(), first);
        let refreshed = clock.refresh();
        assert!(refreshed >= first + 5);
        assert_eq!(clock.cached_ms(), refreshed);
    }

    #[test]
    fn run_with_period_fires_and_rearms() {
        let mut last = 0u64;
        assert!(run_with_period(&mut last, 1000, 100));
        assert_eq!(last, 1000);
        assert!(!run_with_period(&mut last, 1050, 100));
        assert!(run_with_period(&mut last, 1100, 100));
        assert_eq!(last, 1100);
    }
}
