//! Process-wide MVCC clock.
//!
//! Stamps pack milliseconds in the high 44 bits and a per-millisecond
//! counter in the low 20 bits, so stamps order by wall time first and
//! issue order within a millisecond second. The counter carrying into
//! the millisecond part on overflow keeps stamps strictly increasing
//! even under more than 2^20 writes in one millisecond.

use std::sync::atomic::{AtomicU64, Ordering};

/// Bits reserved for the per-millisecond counter.
pub const MVCC_MS_SHIFT: u32 = 20;

/// Stamp value reserved to mean "no stamp recorded".
pub const MVCC_INVALID: u64 = u64::MAX;

/// Monotonic stamp source shared by every database in the process.
#[derive(Debug, Default)]
pub struct MvccClock {
    stamp: AtomicU64,
}

impl MvccClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently issued stamp.
    #[inline]
    pub fn current(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    /// Issues the next stamp. Every write calls this exactly once.
    ///
    /// The new stamp is the larger of "current + 1" and "now_ms shifted
    /// into the high bits": time moves the stamp forward between bursts,
    /// and the +1 keeps it strictly increasing within one.
    pub fn next(&self, now_ms: u64) -> u64 {
        let floor = now_ms << MVCC_MS_SHIFT;
        let mut current = self.stamp.load(Ordering::Relaxed);
        loop {
            let candidate = (current + 1).max(floor);
            match self.stamp.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }

    /// Raises the stamp floor to the current tick time without issuing a
    /// stamp. Called by the periodic driver so stamps track wall time
    /// even across idle stretches.
    pub fn advance_to(&self, now_ms: u64) {
        let floor = now_ms << MVCC_MS_SHIFT;
        self.stamp.fetch_max(floor, Ordering::AcqRel);
    }
}

/// Extracts the millisecond part of a stamp.
#[inline]
pub fn stamp_ms(stamp: u64) -> u64 {
    stamp >> MVCC_MS_SHIFT
}
