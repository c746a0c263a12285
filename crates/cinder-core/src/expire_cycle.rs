//! Active expiration: proactive sampling of the expiration index.
//!
//! Lazy expiration only fires for keys somebody reads; this cycle
//! reclaims the rest. Each round samples random entries from the
//! expiration index, deletes the ones already due, and goes again while
//! the stale ratio stays high — bounded by a wall-clock budget so the
//! command loop is never starved. Replicas skip deletion entirely and
//! wait for the primary's deletes to arrive.

use std::time::Instant;

use crate::db::Database;
use crate::events::DeleteReason;
use crate::time;

/// Entries sampled from the expiration index per round.
const LOOKUPS_PER_LOOP: usize = 20;

/// Keep sampling while at least this fraction of a round was expired.
const STALE_RATIO: f64 = 0.25;

/// Wall-clock budget of a fast cycle, in microseconds.
const FAST_DURATION_US: u128 = 1000;

/// Percentage of CPU a slow cycle may take at a given tick rate.
const SLOW_TIME_PERC: u128 = 25;

/// Hard cap on rounds per cycle, whatever the budgets say.
const MAX_ROUNDS: usize = 16;

/// Which budget the cycle runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// Microseconds-scale, run opportunistically before sleeping.
    Fast,
    /// A bounded fraction of CPU, run from the periodic driver.
    Slow,
}

/// Runs one active expiration cycle. Returns the number of entries
/// reclaimed (whole keys plus subkeys).
pub fn run_expire_cycle(db: &mut Database, mode: CycleMode, hz: u32) -> usize {
    if db.config().replica {
        // replicas mirror primary-issued deletes instead
        return 0;
    }

    let budget_us: u128 = match mode {
        CycleMode::Fast => FAST_DURATION_US,
        CycleMode::Slow => 1_000_000 * SLOW_TIME_PERC / (hz.max(1) as u128) / 100,
    };
    let started = Instant::now();
    let mut total_removed = 0usize;

    for _ in 0..MAX_ROUNDS {
        let sample = db.expires_sample(LOOKUPS_PER_LOOP);
        if sample.is_empty() {
            break;
        }
        let sampled = sample.len();
        let now = time::now_ms();
        let mut removed = 0usize;

        for entry in sample {
            if entry.when_ms > now {
                continue;
            }
            match entry.subkey {
                None => {
                    // fast mode deletes inline; slow mode defers the
                    // destructor work to the reclamation thread
                    let deferred = mode == CycleMode::Slow;
                    if db.delete_inner(&entry.key, DeleteReason::Expired, deferred) {
                        removed += 1;
                    }
                }
                Some(subkey) => {
                    db.expire_subkey(&entry.key, &subkey, entry.when_ms);
                    removed += 1;
                }
            }
        }
        total_removed += removed;

        if (removed as f64) < (sampled as f64) * STALE_RATIO {
            break;
        }
        if started.elapsed().as_micros() >= budget_us {
            break;
        }
    }
    total_removed
}

impl Database {
    /// Random entries from the expiration index, for the cycle above.
    pub(crate) fn expires_sample(&self, n: usize) -> Vec<crate::expire::ExpireEntry> {
        self.expires.random_sample(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::{Event, EventSink};
    use crate::mvcc::MvccClock;
    use crate::value::ObjRef;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_db() -> Database {
        let config = Config::default().db_config(0);
        Database::new(config, Arc::new(MvccClock::new()), EventSink::new())
    }

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn put_with_ttl(db: &mut Database, k: &str, when_ms: u64) {
        db.insert(key(k), ObjRef::string("v"), false, false).unwrap();
        db.set_expire(k.as_bytes(), None, when_ms).unwrap();
    }

    #[test]
    fn removes_due_keys() {
        let mut db = test_db();
        let past = time::now_ms().saturating_sub(1).max(1);
        for i in 0..10 {
            put_with_ttl(&mut db, &format!("dead{i}"), past);
        }
        for i in 0..5 {
            db.insert(key(&format!("alive{i}")), ObjRef::string("v"), false, false)
                .unwrap();
        }

        let removed = run_expire_cycle(&mut db, CycleMode::Slow, 10);
        assert_eq!(removed, 10);
        assert_eq!(db.len(), 5);
        assert_eq!(db.stats().keys_with_expiry, 0);
    }

    #[test]
    fn leaves_future_ttls_alone() {
        let mut db = test_db();
        let future = time::now_ms() + 3_600_000;
        for i in 0..10 {
            put_with_ttl(&mut db, &format!("k{i}"), future);
        }
        assert_eq!(run_expire_cycle(&mut db, CycleMode::Slow, 10), 0);
        assert_eq!(db.len(), 10);
    }

    #[test]
    fn empty_database_is_fine() {
        let mut db = test_db();
        assert_eq!(run_expire_cycle(&mut db, CycleMode::Fast, 10), 0);
    }

    #[test]
    fn replica_skips_deletion() {
        let config = Config {
            replica: true,
            ..Config::default()
        }
        .db_config(0);
        let mut db = Database::new(config, Arc::new(MvccClock::new()), EventSink::new());
        // bypass set_expire's replica-safe path by inserting then
        // stamping the index directly through the public API
        db.insert(key("k"), ObjRef::string("v"), false, false).unwrap();
        db.set_expire(b"k", None, 1).unwrap();

        assert_eq!(run_expire_cycle(&mut db, CycleMode::Slow, 10), 0);
        // data still present until the primary's delete arrives
        assert!(db.primary.contains(b"k"));
    }

    #[test]
    fn expired_events_are_emitted() {
        let events = EventSink::new();
        let expired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&expired);
        events.subscribe(move |ev| {
            if let Event::KeyDeleted {
                reason: DeleteReason::Expired,
                ..
            } = ev
            {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let config = Config::default().db_config(0);
        let mut db = Database::new(config, Arc::new(MvccClock::new()), events);

        put_with_ttl(&mut db, "dead", time::now_ms().saturating_sub(1).max(1));
        run_expire_cycle(&mut db, CycleMode::Slow, 10);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subkey_expiry_trims_collection() {
        use crate::value::Payload;
        use ahash::AHashMap;

        let mut db = test_db();
        let mut fields = AHashMap::new();
        fields.insert(Bytes::from_static(b"f1"), Bytes::from_static(b"v1"));
        fields.insert(Bytes::from_static(b"f2"), Bytes::from_static(b"v2"));
        db.insert(key("h"), ObjRef::new(Payload::Hash(fields)), false, false)
            .unwrap();
        db.set_expire(b"h", Some(Bytes::from_static(b"f1")), 1).unwrap();

        let removed = run_expire_cycle(&mut db, CycleMode::Slow, 10);
        assert_eq!(removed, 1);

        let value = db.get(b"h").unwrap();
        match value.object().payload() {
            Payload::Hash(fields) => {
                assert!(!fields.contains_key(b"f1".as_slice()));
                assert!(fields.contains_key(b"f2".as_slice()));
            }
            other => panic!("expected hash, got {other:?}"),
        }
    }
}
