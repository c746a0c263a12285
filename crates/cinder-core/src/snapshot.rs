//! Stacked copy-on-write snapshots over a database.
//!
//! Creating a snapshot moves the live primary and tombstone tables into
//! an immutable node and restarts the live layer empty; reads descend
//! the parent chain, and deletions in the live layer shadow deeper
//! bindings with tombstones. Nodes live in an arena keyed by id, with
//! explicit refcounts driving the lifecycle; each node is additionally
//! held by an `Arc` so a reader can walk its chain without any lock
//! while writers proceed.
//!
//! When the newest snapshot's last reader ends, its non-overwritten
//! bindings merge back into the live primary and its parent is spliced
//! into place. Deeper released levels collapse the same way once they
//! become the direct parent, driven by the periodic consolidation pass.

use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use tracing::debug;

use crate::db::Database;
use crate::events::Event;
use crate::expire::ExpireIndex;
use crate::serial;
use crate::table::RawTable;
use crate::time;
use crate::value::ObjRef;

/// Identifier of a snapshot node within its database's arena.
pub type SnapshotId = u64;

/// Optional snapshot requests are declined past this chain depth; the
/// caller falls back to synchronous iteration instead of growing the
/// read path further.
pub const MAX_OPTIONAL_SNAPSHOT_DEPTH: u32 = 4;

/// One immutable level of the snapshot chain.
pub struct SnapshotNode {
    pub(crate) primary: RawTable<ObjRef>,
    pub(crate) tombstone: RawTable<()>,
    pub(crate) expires: ExpireIndex,
    pub(crate) parent: Option<SnapshotId>,
    pub(crate) mvcc_checkpoint: u64,
    pub(crate) depth: u32,
    pub(crate) created_ms: u64,
}

impl SnapshotNode {
    /// The MVCC stamp this level was cut at.
    pub fn mvcc_checkpoint(&self) -> u64 {
        self.mvcc_checkpoint
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }
}

struct Slot {
    node: Arc<SnapshotNode>,
    refcount: u32,
}

/// Arena of snapshot nodes for one database.
#[derive(Default)]
pub struct SnapshotArena {
    slots: AHashMap<SnapshotId, Slot>,
    next: SnapshotId,
}

impl SnapshotArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn insert(&mut self, node: SnapshotNode) -> SnapshotId {
        let id = self.next;
        self.next += 1;
        self.slots.insert(
            id,
            Slot {
                node: Arc::new(node),
                refcount: 1,
            },
        );
        id
    }

    pub(crate) fn node(&self, id: SnapshotId) -> &SnapshotNode {
        &self.slots.get(&id).expect("dangling snapshot id").node
    }

    pub(crate) fn node_arc(&self, id: SnapshotId) -> Arc<SnapshotNode> {
        Arc::clone(&self.slots.get(&id).expect("dangling snapshot id").node)
    }

    pub(crate) fn retain(&mut self, id: SnapshotId) {
        self.slots.get_mut(&id).expect("dangling snapshot id").refcount += 1;
    }

    /// Decrements and returns the remaining count.
    pub(crate) fn release(&mut self, id: SnapshotId) -> u32 {
        let slot = self.slots.get_mut(&id).expect("dangling snapshot id");
        slot.refcount = slot.refcount.saturating_sub(1);
        slot.refcount
    }

    pub(crate) fn refcount(&self, id: SnapshotId) -> u32 {
        self.slots.get(&id).map(|s| s.refcount).unwrap_or(0)
    }

    /// Removes a released node from the arena.
    pub(crate) fn remove(&mut self, id: SnapshotId) -> Arc<SnapshotNode> {
        let slot = self.slots.remove(&id).expect("dangling snapshot id");
        debug_assert_eq!(slot.refcount, 0, "removing a referenced snapshot");
        slot.node
    }
}

/// A lock-free point-in-time view: the chain of `Arc`s captured when
/// the reader was opened. Resolution and iteration shadow deeper
/// bindings with shallower tombstones.
pub struct SnapshotReader {
    levels: Vec<Arc<SnapshotNode>>,
}

impl SnapshotReader {
    /// The checkpoint of the newest captured level.
    pub fn mvcc_checkpoint(&self) -> u64 {
        self.levels.first().map(|n| n.mvcc_checkpoint).unwrap_or(0)
    }

    /// Point lookup through the captured chain.
    pub fn get(&self, key: &[u8]) -> Option<&ObjRef> {
        for level in &self.levels {
            if level.tombstone.contains(key) {
                return None;
            }
            if let Some(value) = level.primary.get(key) {
                return Some(value);
            }
        }
        None
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Whether any captured level binds or tombstones `key`. Used to
    /// skip storage entries already covered by the in-memory view.
    pub fn masks(&self, key: &[u8]) -> bool {
        for level in &self.levels {
            if level.tombstone.contains(key) || level.primary.contains(key) {
                return true;
            }
        }
        false
    }

    /// The whole-key expire time as of the snapshot.
    pub fn expire_time(&self, key: &[u8]) -> Option<u64> {
        self.levels.first()?.expires.get(key, None)
    }

    /// Visits every binding visible at the snapshot. Each key is
    /// reported once, from its shallowest binding.
    pub fn iterate(&self, f: &mut dyn FnMut(&Bytes, &ObjRef) -> bool) -> bool {
        let mut seen = ahash::AHashSet::new();
        for level in &self.levels {
            let keep_going = level.primary.iterate(&mut |key, value| {
                if seen.insert(key.clone()) {
                    return f(key, value);
                }
                true
            });
            if !keep_going {
                return false;
            }
            level.tombstone.iterate(&mut |key, _| {
                seen.insert(key.clone());
                true
            });
        }
        true
    }

    /// Number of bindings visible at the snapshot.
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.iterate(&mut |_, _| {
            count += 1;
            true
        });
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Database {
    /// Materialises the current state as an immutable snapshot level
    /// and restarts the live tables empty.
    ///
    /// An `optional` request reuses the existing newest level when its
    /// checkpoint already covers `mvcc_checkpoint`, and is declined
    /// (`None`) once the chain is [`MAX_OPTIONAL_SNAPSHOT_DEPTH`] deep
    /// — the caller then falls back to synchronous iteration.
    pub fn create_snapshot(&mut self, mvcc_checkpoint: u64, optional: bool) -> Option<SnapshotId> {
        if let Some(id) = self.snapshot {
            let node = self.arena.node(id);
            if optional && node.mvcc_checkpoint >= mvcc_checkpoint {
                self.arena.retain(id);
                return Some(id);
            }
            if optional && node.depth + 1 > MAX_OPTIONAL_SNAPSHOT_DEPTH {
                return None;
            }
        }

        let depth = self
            .snapshot
            .map(|id| self.arena.node(id).depth + 1)
            .unwrap_or(1);
        let node = SnapshotNode {
            primary: std::mem::take(&mut self.primary),
            tombstone: std::mem::take(&mut self.tombstone),
            expires: self.expires.clone(),
            parent: self.snapshot,
            mvcc_checkpoint,
            depth,
            created_ms: time::now_ms(),
        };
        let id = self.arena.insert(node);
        self.snapshot = Some(id);
        debug!(db = self.config.index, id, depth, "snapshot created");
        self.events.emit(Event::SnapshotCreated {
            db: self.config.index,
            depth,
        });
        Some(id)
    }

    /// A lock-free reader over the chain rooted at `id`. The caller
    /// must hold the snapshot (via `create_snapshot`) until done.
    pub fn reader(&self, id: SnapshotId) -> SnapshotReader {
        let mut levels = Vec::new();
        let mut cur = Some(id);
        while let Some(level_id) = cur {
            let node = self.arena.node_arc(level_id);
            cur = node.parent;
            levels.push(node);
        }
        SnapshotReader { levels }
    }

    /// Releases a snapshot. When the last reference to the newest
    /// level drops, its surviving bindings merge back into the live
    /// primary and the grandparent is spliced into place.
    pub fn end_snapshot(&mut self, id: SnapshotId) {
        self.arena.release(id);
        self.events.emit(Event::SnapshotEnded {
            db: self.config.index,
        });
        self.consolidate_children();
    }

    /// Releases a snapshot without merging; the periodic consolidation
    /// pass collapses released levels later.
    pub fn end_snapshot_async(&mut self, id: SnapshotId) {
        self.arena.release(id);
        self.events.emit(Event::SnapshotEnded {
            db: self.config.index,
        });
    }

    /// Collapses released levels from the top of the chain into the
    /// live layer. Returns how many levels were merged.
    pub fn consolidate_children(&mut self) -> usize {
        let mut merged = 0;
        while self.collapse_parent() {
            merged += 1;
        }
        merged
    }

    /// Current chain depth under the live layer.
    pub fn snapshot_depth(&self) -> u32 {
        self.snapshot
            .map(|id| self.arena.node(id).depth)
            .unwrap_or(0)
    }

    /// Age of the newest snapshot level in milliseconds, if any.
    pub fn snapshot_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.snapshot
            .map(|id| now_ms.saturating_sub(self.arena.node(id).created_ms))
    }

    /// Merges the direct parent into the live layer when released.
    fn collapse_parent(&mut self) -> bool {
        let Some(id) = self.snapshot else {
            return false;
        };
        if self.arena.refcount(id) > 0 {
            return false;
        }
        let arc = self.arena.remove(id);
        let (node_primary, node_tombstone, parent) = match Arc::try_unwrap(arc) {
            Ok(node) => (node.primary, node.tombstone, node.parent),
            // a straggler still holds the node; fall back to copying
            // the bindings (cheap reference clones) and let the arc
            // expire on its own
            Err(arc) => {
                let mut primary = RawTable::new();
                arc.primary.iterate(&mut |k, v| {
                    primary.insert(k.clone(), v.clone(), true);
                    true
                });
                let mut tombstone = RawTable::new();
                arc.tombstone.iterate(&mut |k, _| {
                    tombstone.insert(k.clone(), (), true);
                    true
                });
                (primary, tombstone, arc.parent)
            }
        };

        // bindings neither overwritten nor deleted in the child move
        // back into the live primary, stamps preserved
        for (key, value) in node_primary.into_entries() {
            if !self.primary.contains(&key) && !self.tombstone.contains(&key) {
                self.primary.insert(key, value, true);
            }
        }
        self.snapshot = parent;
        if parent.is_some() {
            // the node's own tombstones still shadow deeper levels
            for (key, ()) in node_tombstone.into_entries() {
                if !self.primary.contains(&key) {
                    self.tombstone.insert(key, (), false);
                }
            }
        } else {
            // nothing deeper to shadow; every tombstone is now moot
            let old = std::mem::take(&mut self.tombstone);
            if let Some(handle) = &self.drop_handle {
                handle.defer_tombstones(old);
            }
        }
        debug!(db = self.config.index, id, "snapshot level collapsed");
        true
    }

    /// Drops live tombstones whose keys no deeper level binds. Scans at
    /// most `max_scan` tombstones per call.
    pub fn gc_tombstones(&mut self, max_scan: usize) -> usize {
        if self.tombstone.is_empty() {
            return 0;
        }
        let candidates: Vec<Bytes> = self
            .tombstone
            .iter()
            .take(max_scan)
            .map(|(k, _)| k.clone())
            .collect();
        let mut dropped = 0;
        for key in candidates {
            if !self.chain_contains(&key) {
                self.tombstone.remove(&key);
                dropped += 1;
            }
        }
        dropped
    }

    /// Iterates a consistent view of the whole database — in-memory
    /// layers plus storage-resident keys — while writers proceed.
    ///
    /// Prefers an optional snapshot; when the depth budget declines
    /// one, iteration runs synchronously under the caller's lock.
    /// `keys_only` skips value materialisation for storage entries;
    /// `cache_only` skips the storage pass entirely.
    pub fn iterate_threadsafe(
        &mut self,
        keys_only: bool,
        cache_only: bool,
        f: &mut dyn FnMut(&Bytes, Option<&ObjRef>) -> bool,
    ) -> bool {
        let checkpoint = self.clock.current();
        match self.create_snapshot(checkpoint, true) {
            Some(id) => {
                let reader = self.reader(id);
                let mut complete = reader.iterate(&mut |k, v| {
                    f(k, if keys_only { None } else { Some(v) })
                });
                if complete && !cache_only {
                    complete =
                        self.iterate_storage_rest(&mut |key| reader.masks(key), keys_only, f);
                }
                self.end_snapshot(id);
                complete
            }
            None => {
                let mut complete =
                    self.iterate(&mut |k, v| f(k, if keys_only { None } else { Some(v) }));
                if complete && !cache_only {
                    let mask_snapshot = self.snapshot;
                    complete = self.iterate_storage_rest(
                        &mut |key| {
                            self.primary.contains(key)
                                || self.tombstone.contains(key)
                                || {
                                    let mut cur = mask_snapshot;
                                    loop {
                                        match cur {
                                            None => break false,
                                            Some(id) => {
                                                let node = self.arena.node(id);
                                                if node.tombstone.contains(key)
                                                    || node.primary.contains(key)
                                                {
                                                    break true;
                                                }
                                                cur = node.parent;
                                            }
                                        }
                                    }
                                }
                        },
                        keys_only,
                        f,
                    );
                }
                complete
            }
        }
    }

    /// Storage pass of a full iteration: every provider key the
    /// in-memory view doesn't already cover.
    fn iterate_storage_rest(
        &self,
        masked: &mut dyn FnMut(&[u8]) -> bool,
        keys_only: bool,
        f: &mut dyn FnMut(&Bytes, Option<&ObjRef>) -> bool,
    ) -> bool {
        let Some(cache) = &self.storage else {
            return true;
        };
        cache.enumerate(&mut |key, raw| {
            if masked(key) {
                return true;
            }
            let key = Bytes::copy_from_slice(key);
            if keys_only {
                return f(&key, None);
            }
            let (value, _) = serial::deserialize(raw)
                .unwrap_or_else(|e| panic!("corrupt storage record for key: {e}"));
            f(&key, Some(&value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventSink;
    use crate::mvcc::MvccClock;
    use crate::value::Payload;

    fn test_db() -> Database {
        let config = Config::default().db_config(0);
        Database::new(config, Arc::new(MvccClock::new()), EventSink::new())
    }

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn put(db: &mut Database, k: &str, v: &str) {
        db.insert(key(k), ObjRef::string(v.to_string()), false, false)
            .unwrap();
    }

    fn text(v: &ObjRef) -> Bytes {
        match v.object().payload() {
            Payload::Str(b) => b.clone(),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_isolates_from_later_writes() {
        let mut db = test_db();
        put(&mut db, "a", "1");
        put(&mut db, "b", "2");

        let id = db.create_snapshot(db.mvcc_checkpoint(), false).unwrap();
        let reader = db.reader(id);

        put(&mut db, "a", "3");
        db.delete(b"b");

        // the snapshot still sees exactly {a:1, b:2}
        assert_eq!(text(reader.get(b"a").unwrap()), key("1"));
        assert_eq!(text(reader.get(b"b").unwrap()), key("2"));
        assert_eq!(reader.len(), 2);

        // the live view sees {a:3}
        assert_eq!(text(&db.get(b"a").unwrap()), key("3"));
        assert!(db.get(b"b").is_none());
        assert_eq!(db.len(), 1);

        drop(reader);
        db.end_snapshot(id);
    }

    #[test]
    fn merge_back_restores_untouched_bindings() {
        let mut db = test_db();
        put(&mut db, "kept", "v1");
        put(&mut db, "overwritten", "old");
        put(&mut db, "deleted", "gone");

        let id = db.create_snapshot(db.mvcc_checkpoint(), false).unwrap();
        put(&mut db, "overwritten", "new");
        db.delete(b"deleted");
        db.end_snapshot(id);

        assert!(db.snapshot.is_none());
        assert_eq!(text(&db.get(b"kept").unwrap()), key("v1"));
        assert_eq!(text(&db.get(b"overwritten").unwrap()), key("new"));
        assert!(db.get(b"deleted").is_none());
        // with no chain left, no tombstones either
        assert!(db.tombstone.is_empty());
    }

    #[test]
    fn chain_of_two_levels_resolves_deep_bindings() {
        let mut db = test_db();
        put(&mut db, "deep", "d");
        let first = db.create_snapshot(db.mvcc_checkpoint(), false).unwrap();
        put(&mut db, "mid", "m");
        let second = db.create_snapshot(db.mvcc_checkpoint(), false).unwrap();
        put(&mut db, "top", "t");

        assert_eq!(db.snapshot_depth(), 2);
        // live resolution reaches through both levels
        assert_eq!(text(&db.get(b"deep").unwrap()), key("d"));
        assert_eq!(text(&db.get(b"mid").unwrap()), key("m"));

        // reader over the newest snapshot sees deep and mid, not top
        let reader = db.reader(second);
        assert!(reader.contains(b"deep"));
        assert!(reader.contains(b"mid"));
        assert!(!reader.contains(b"top"));
        drop(reader);

        db.end_snapshot(second);
        db.end_snapshot(first);
        assert_eq!(db.snapshot_depth(), 0);
        assert_eq!(db.len(), 3);
    }

    #[test]
    fn deletion_under_snapshot_is_tombstoned() {
        let mut db = test_db();
        put(&mut db, "a", "1");
        let id = db.create_snapshot(db.mvcc_checkpoint(), false).unwrap();

        assert!(db.delete(b"a"));
        assert!(db.get(b"a").is_none());
        assert!(db.tombstone.contains(b"a"));
        // never in both primary and tombstone
        assert!(!db.primary.contains(b"a"));

        // re-insert revives the key and clears the tombstone
        put(&mut db, "a", "2");
        assert!(!db.tombstone.contains(b"a"));
        assert_eq!(text(&db.get(b"a").unwrap()), key("2"));

        db.end_snapshot(id);
        assert_eq!(text(&db.get(b"a").unwrap()), key("2"));
    }

    #[test]
    fn optional_snapshot_reuses_fresh_level() {
        let mut db = test_db();
        put(&mut db, "a", "1");
        let checkpoint = db.mvcc_checkpoint();

        let first = db.create_snapshot(checkpoint, false).unwrap();
        let second = db.create_snapshot(checkpoint, true).unwrap();
        assert_eq!(first, second);
        assert_eq!(db.snapshot_depth(), 1);

        db.end_snapshot(second);
        // still held by the first reference
        assert_eq!(db.snapshot_depth(), 1);
        db.end_snapshot(first);
        assert_eq!(db.snapshot_depth(), 0);
    }

    #[test]
    fn optional_snapshot_declined_past_depth_budget() {
        let mut db = test_db();
        let mut held = Vec::new();
        for i in 0..MAX_OPTIONAL_SNAPSHOT_DEPTH {
            put(&mut db, &format!("k{i}"), "v");
            held.push(db.create_snapshot(db.mvcc_checkpoint(), false).unwrap());
        }
        put(&mut db, "latest", "v");
        // a newer checkpoint can't reuse, and the chain is at budget
        assert!(db
            .create_snapshot(db.mvcc_checkpoint(), true)
            .is_none());
        for id in held.into_iter().rev() {
            db.end_snapshot(id);
        }
    }

    #[test]
    fn async_end_defers_merge_to_consolidation() {
        let mut db = test_db();
        put(&mut db, "a", "1");
        let id = db.create_snapshot(db.mvcc_checkpoint(), false).unwrap();

        db.end_snapshot_async(id);
        // level still in place until the maintenance pass runs
        assert_eq!(db.snapshot_depth(), 1);
        assert_eq!(db.consolidate_children(), 1);
        assert_eq!(db.snapshot_depth(), 0);
        assert_eq!(text(&db.get(b"a").unwrap()), key("1"));
    }

    #[test]
    fn gc_drops_unshadowed_tombstones() {
        let mut db = test_db();
        put(&mut db, "only-live", "v");
        let id = db.create_snapshot(db.mvcc_checkpoint(), false).unwrap();
        // delete a key that exists in the snapshot: tombstone must stay
        db.delete(b"only-live");
        assert!(db.tombstone.contains(b"only-live"));
        assert_eq!(db.gc_tombstones(100), 0);
        assert!(db.tombstone.contains(b"only-live"));
        db.end_snapshot(id);
        assert!(db.get(b"only-live").is_none());
    }

    #[test]
    fn iterate_threadsafe_sees_consistent_view() {
        let mut db = test_db();
        put(&mut db, "a", "1");
        put(&mut db, "b", "2");

        let mut seen = Vec::new();
        db.iterate_threadsafe(false, false, &mut |k, v| {
            seen.push((k.clone(), text(v.unwrap())));
            true
        });
        seen.sort();
        assert_eq!(seen, vec![(key("a"), key("1")), (key("b"), key("2"))]);
        // the iteration snapshot was released afterwards
        assert_eq!(db.snapshot_depth(), 0);
    }

    #[test]
    fn mvcc_checkpoints_monotonic_along_chain() {
        let mut db = test_db();
        put(&mut db, "a", "1");
        let first = db.create_snapshot(db.mvcc_checkpoint(), false).unwrap();
        let first_cp = db.arena.node(first).mvcc_checkpoint();
        put(&mut db, "b", "2");
        let second = db.create_snapshot(db.mvcc_checkpoint(), false).unwrap();
        let second_cp = db.arena.node(second).mvcc_checkpoint();
        assert!(second_cp > first_cp);
        db.end_snapshot(second);
        db.end_snapshot(first);
    }
}
