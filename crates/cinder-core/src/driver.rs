//! The periodic maintenance driver.
//!
//! A tick runs roughly `hz` times per second and interleaves every
//! background duty the engine owes: refreshing the cached clock and the
//! MVCC floor, stepping incremental rehashes, the active-expire cycle,
//! snapshot consolidation and tombstone GC, and — in write-back mode —
//! kicking the storage flush when its period has elapsed. Each duty is
//! budgeted so no single tick stalls command processing.

use std::time::Duration;

use tracing::trace;

use crate::config::{Config, MemoryModel};
use crate::db::Database;
use crate::expire_cycle::{run_expire_cycle, CycleMode};
use crate::mvcc::MvccClock;
use crate::time::{run_with_period, CachedClock};

/// Rehash budget per database per tick.
const REHASH_BUDGET: Duration = Duration::from_millis(1);

/// Tombstones scanned per database per tick.
const TOMBSTONE_GC_SCAN: usize = 64;

/// Periodic work state.
pub struct Driver {
    last_flush_ms: u64,
    /// While a fork child shares our pages, resizes are suppressed to
    /// keep copy-on-write cheap.
    fork_child_active: bool,
}

impl Driver {
    pub fn new() -> Self {
        Self {
            last_flush_ms: 0,
            fork_child_active: false,
        }
    }

    /// Records that a background-save fork child exists (or exited),
    /// pausing or resuming table resizes accordingly.
    pub fn set_fork_child(&mut self, dbs: &mut [Database], active: bool) {
        if self.fork_child_active == active {
            return;
        }
        self.fork_child_active = active;
        for db in dbs {
            if active {
                db.primary.pause_resize();
                db.tombstone.pause_resize();
            } else {
                db.primary.resume_resize();
                db.tombstone.resume_resize();
            }
        }
    }

    pub fn fork_child_active(&self) -> bool {
        self.fork_child_active
    }

    /// One maintenance tick across all databases.
    pub fn tick(
        &mut self,
        dbs: &mut [Database],
        config: &Config,
        clock: &CachedClock,
        mvcc: &MvccClock,
    ) {
        let now = clock.refresh();
        mvcc.advance_to(now);

        let mut expired = 0usize;
        for db in dbs.iter_mut() {
            if !self.fork_child_active {
                db.primary.try_resize();
                db.primary.rehash_for(REHASH_BUDGET);
                db.tombstone.try_resize();
                db.tombstone.rehash_for(REHASH_BUDGET);
            }

            expired += run_expire_cycle(db, CycleMode::Slow, config.hz);

            // proactive eviction: reads alone never trigger the write
            // path's capacity check, so pressure is relieved here too
            let _ = crate::evict::perform_evictions(db, now);

            // collapse released snapshot levels once they lag too far
            if db
                .snapshot_age_ms(now)
                .is_some_and(|age| age >= config.snapshot_slip_ms)
            {
                db.consolidate_children();
            }
            db.gc_tombstones(TOMBSTONE_GC_SCAN);
        }

        if config.memory_model == MemoryModel::WriteBack
            && run_with_period(&mut self.last_flush_ms, now, config.storage_flush_period_ms)
        {
            for db in dbs.iter_mut() {
                if db.process_changes(true) {
                    db.commit_changes();
                }
            }
        }

        if expired > 0 {
            trace!(expired, "active expire cycle reclaimed keys");
        }
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventSink;
    use crate::time;
    use crate::value::ObjRef;
    use bytes::Bytes;
    use std::sync::Arc;

    fn setup(config: &Config) -> (Vec<Database>, CachedClock, Arc<MvccClock>) {
        let mvcc = Arc::new(MvccClock::new());
        let dbs = (0..2)
            .map(|i| Database::new(config.db_config(i), Arc::clone(&mvcc), EventSink::new()))
            .collect();
        (dbs, CachedClock::new(), mvcc)
    }

    #[test]
    fn tick_reclaims_expired_keys() {
        let config = Config::default();
        let (mut dbs, clock, mvcc) = setup(&config);
        let mut driver = Driver::new();

        let past = time::now_ms().saturating_sub(1).max(1);
        for i in 0..10 {
            let key = Bytes::from(format!("k{i}"));
            dbs[0]
                .insert(key.clone(), ObjRef::string("v"), false, false)
                .unwrap();
            dbs[0].set_expire(&key, None, past).unwrap();
        }

        driver.tick(&mut dbs, &config, &clock, &mvcc);
        assert_eq!(dbs[0].len(), 0);
    }

    #[test]
    fn tick_advances_clocks() {
        let config = Config::default();
        let (mut dbs, clock, mvcc) = setup(&config);
        let mut driver = Driver::new();

        let before = mvcc.current();
        std::thread::sleep(Duration::from_millis(3));
        driver.tick(&mut dbs, &config, &clock, &mvcc);
        assert!(mvcc.current() >= before);
        assert!(clock.cached_ms() >= 3);
    }

    #[test]
    fn fork_child_pauses_and_resumes() {
        let config = Config::default();
        let (mut dbs, _clock, _mvcc) = setup(&config);
        let mut driver = Driver::new();

        driver.set_fork_child(&mut dbs, true);
        assert!(driver.fork_child_active());
        // idempotent
        driver.set_fork_child(&mut dbs, true);
        driver.set_fork_child(&mut dbs, false);
        assert!(!driver.fork_child_active());
    }

    #[test]
    fn tick_collapses_released_snapshots() {
        let config = Config {
            snapshot_slip_ms: 0,
            ..Config::default()
        };
        let (mut dbs, clock, mvcc) = setup(&config);
        let mut driver = Driver::new();

        dbs[0]
            .insert(Bytes::from_static(b"a"), ObjRef::string("1"), false, false)
            .unwrap();
        let checkpoint = dbs[0].mvcc_checkpoint();
        let id = dbs[0].create_snapshot(checkpoint, false).unwrap();
        dbs[0].end_snapshot_async(id);
        assert_eq!(dbs[0].snapshot_depth(), 1);

        driver.tick(&mut dbs, &config, &clock, &mvcc);
        assert_eq!(dbs[0].snapshot_depth(), 0);
    }
}
