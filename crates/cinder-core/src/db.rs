//! One logical database: the persistent-data layer.
//!
//! Composes the primary keyspace table, the tombstone table, the
//! expiration index, the dirty set, and an optional storage cache into
//! a single resolution order:
//!
//! 1. `primary` — hit wins;
//! 2. `tombstone` — hit means deleted, stop;
//! 3. the snapshot parent chain, shallowest first, same two steps per
//!    level;
//! 4. the storage provider, which is authoritative for anything the
//!    in-memory layers don't know about. Read-through promotes into
//!    `primary` as a cache, without marking the key dirty.
//!
//! All mutations run single-writer (the embedding server holds its
//! coordination lock); snapshot levels are immutable from creation, so
//! readers descend the chain without any lock at all.

use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use smallvec::SmallVec;
use tracing::debug;

use cinder_storage::StorageCache;

use crate::config::{DbConfig, MemoryModel};
use crate::dirty::DirtySet;
use crate::dropper::DropHandle;
use crate::error::EngineError;
use crate::events::{DeleteReason, Event, EventSink};
use crate::evict::{self, EvictionPool};
use crate::expire::{ExpireEntry, ExpireIndex};
use crate::memory::{self, MemoryTracker};
use crate::mvcc::MvccClock;
use crate::serial;
use crate::snapshot::{SnapshotArena, SnapshotId};
use crate::table::{InsertOutcome, RawTable};
use crate::time;
use crate::value::{ObjRef, Payload};

/// Writes queued by `process_changes`, replayed by `commit_changes`.
#[derive(Debug, Default)]
pub(crate) struct PendingFlush {
    pub(crate) clear_first: bool,
    pub(crate) puts: Vec<(Bytes, Vec<u8>)>,
    pub(crate) dels: Vec<Bytes>,
}

impl PendingFlush {
    fn is_empty(&self) -> bool {
        !self.clear_first && self.puts.is_empty() && self.dels.is_empty()
    }
}

/// Counters surfaced through INFO-class reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbStats {
    pub key_count: usize,
    pub used_bytes: usize,
    pub keys_with_expiry: usize,
    pub expired_total: u64,
    pub evicted_total: u64,
    pub storage_hits: u64,
    pub storage_misses: u64,
    pub snapshot_depth: u32,
}

/// A single logical database.
pub struct Database {
    pub(crate) config: DbConfig,
    pub(crate) primary: RawTable<ObjRef>,
    pub(crate) tombstone: RawTable<()>,
    pub(crate) expires: ExpireIndex,
    pub(crate) dirty: DirtySet,
    pub(crate) tracking_depth: u32,
    pub(crate) storage: Option<StorageCache>,
    pub(crate) arena: SnapshotArena,
    /// Parent snapshot of the live layer, newest level of the chain.
    pub(crate) snapshot: Option<SnapshotId>,
    pub(crate) mvcc_checkpoint: u64,
    pub(crate) memory: MemoryTracker,
    pub(crate) events: EventSink,
    pub(crate) clock: Arc<MvccClock>,
    pub(crate) drop_handle: Option<DropHandle>,
    pub(crate) pool: EvictionPool,
    pub(crate) pending: PendingFlush,
    pub(crate) key_cache_enabled: bool,
    pub(crate) expired_total: u64,
    pub(crate) evicted_total: u64,
    pub(crate) storage_hits: u64,
    pub(crate) storage_misses: u64,
}

impl Database {
    pub fn new(config: DbConfig, clock: Arc<MvccClock>, events: EventSink) -> Self {
        Self {
            config,
            primary: RawTable::new(),
            tombstone: RawTable::new(),
            expires: ExpireIndex::new(),
            dirty: DirtySet::new(),
            tracking_depth: 0,
            storage: None,
            arena: SnapshotArena::new(),
            snapshot: None,
            mvcc_checkpoint: 0,
            memory: MemoryTracker::new(),
            events,
            clock,
            drop_handle: None,
            pool: EvictionPool::new(),
            pending: PendingFlush::default(),
            key_cache_enabled: true,
            expired_total: 0,
            evicted_total: 0,
            storage_hits: 0,
            storage_misses: 0,
        }
    }

    /// Attaches the storage cache backing this database.
    pub fn attach_storage(&mut self, cache: StorageCache) {
        self.storage = Some(cache);
    }

    /// Attaches the background reclamation handle; without one,
    /// deferred drops run inline.
    pub fn set_drop_handle(&mut self, handle: DropHandle) {
        self.drop_handle = Some(handle);
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn has_storage(&self) -> bool {
        self.storage.is_some()
    }

    pub fn index(&self) -> usize {
        self.config.index
    }

    pub fn used_bytes(&self) -> usize {
        self.memory.used_bytes()
    }

    /// The MVCC stamp of the most recent write to this database.
    pub fn mvcc_checkpoint(&self) -> u64 {
        self.mvcc_checkpoint
    }

    // -----------------------------------------------------------------
    // lookup
    // -----------------------------------------------------------------

    /// Looks up `key`, running lazy expiration first. Chain and storage
    /// hits are promoted into the primary table as cached bindings.
    pub fn get(&mut self, key: &[u8]) -> Option<ObjRef> {
        if self.expire_if_needed(key) {
            return None;
        }
        if let Some(value) = self.primary.get(key) {
            let value = value.clone();
            self.touch(&value);
            return Some(value);
        }
        if self.tombstone.contains(key) {
            return None;
        }
        if let Some(found) = self.chain_lookup(key) {
            // lazy read-through from the snapshot chain: cache the
            // binding in the live layer, stamp preserved, not dirty
            self.primary
                .insert(Bytes::copy_from_slice(key), found.clone(), true);
            self.touch(&found);
            return Some(found);
        }
        if self.chain_tombstoned(key) {
            return None;
        }
        self.storage_lookup(key)
    }

    /// Looks at a resident binding without promoting or touching.
    pub fn peek(&self, key: &[u8]) -> Option<&ObjRef> {
        self.primary.get(key)
    }

    /// Looks up `key` and enforces the expected type, the way command
    /// implementations do before operating on a value. The binding is
    /// left untouched on a mismatch.
    pub fn get_expect(
        &mut self,
        key: &[u8],
        tag: crate::value::TypeTag,
    ) -> Result<Option<ObjRef>, EngineError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) if value.object().type_tag() == tag => Ok(Some(value)),
            Some(_) => Err(EngineError::WrongType),
        }
    }

    /// Whether `key` currently resolves to a value.
    pub fn exists(&mut self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    fn touch(&self, value: &ObjRef) {
        evict::touch(
            value.object(),
            self.config.eviction_policy,
            time::now_ms(),
            self.config.lfu_log_factor,
            self.config.lfu_decay_time_min,
        );
    }

    /// Resolves through the snapshot chain only. `None` means neither
    /// bound nor tombstoned up the chain.
    fn chain_lookup(&self, key: &[u8]) -> Option<ObjRef> {
        let mut cur = self.snapshot;
        while let Some(id) = cur {
            let node = self.arena.node(id);
            if node.tombstone.contains(key) {
                return None;
            }
            if let Some(value) = node.primary.get(key) {
                return Some(value.clone());
            }
            cur = node.parent;
        }
        None
    }

    fn chain_tombstoned(&self, key: &[u8]) -> bool {
        let mut cur = self.snapshot;
        while let Some(id) = cur {
            let node = self.arena.node(id);
            if node.tombstone.contains(key) {
                return true;
            }
            if node.primary.contains(key) {
                return false;
            }
            cur = node.parent;
        }
        false
    }

    /// Whether the chain (not the live layer, not storage) binds `key`.
    pub(crate) fn chain_contains(&self, key: &[u8]) -> bool {
        self.chain_lookup(key).is_some()
    }

    fn storage_lookup(&mut self, key: &[u8]) -> Option<ObjRef> {
        let raw = {
            let cache = self.storage.as_ref()?;
            let mut raw: Option<Vec<u8>> = None;
            cache.get(key, &mut |bytes| raw = Some(bytes.to_vec()));
            raw
        };
        let db = self.config.index;
        match raw {
            None => {
                self.storage_misses += 1;
                self.events.emit(Event::StorageReadMiss { db });
                None
            }
            Some(raw) => {
                self.storage_hits += 1;
                self.events.emit(Event::StorageReadHit { db });
                // an unreadable record means the store is corrupt;
                // continuing would silently lose data
                let (value, expire) = serial::deserialize(&raw)
                    .unwrap_or_else(|e| panic!("corrupt storage record for key: {e}"));
                if let Some(when) = expire {
                    self.expires.set(Bytes::copy_from_slice(key), None, when);
                }
                if self.expires.any_for_key(key) {
                    value.set_has_expire(true);
                }
                self.touch(&value);
                if self.key_cache_enabled {
                    let key = Bytes::copy_from_slice(key);
                    self.memory.add(&key, &value);
                    self.primary.insert(key, value.clone(), true);
                }
                Some(value)
            }
        }
    }

    // -----------------------------------------------------------------
    // writes
    // -----------------------------------------------------------------

    /// Binds `key` to `value`. Returns `true` when the key was new.
    ///
    /// `assume_new` skips the overwrite probe (bulk load paths).
    /// `keep_ttl` carries an existing expiration across an overwrite;
    /// otherwise the overwrite drops it.
    pub fn insert(
        &mut self,
        key: Bytes,
        mut value: ObjRef,
        assume_new: bool,
        keep_ttl: bool,
    ) -> Result<bool, EngineError> {
        self.expire_if_needed(&key);
        if !assume_new {
            // pull a chain- or storage-resident binding into the live
            // layer so the overwrite below observes it
            self.ensure_resident(&key);
        }

        let had_ttl = self.expires.contains_key(&key);
        let keeps_ttl = keep_ttl && had_ttl;
        if keeps_ttl && value.is_shared() {
            value = value.owned_copy();
        }

        let increase = if let Some(old) = self.primary.get(&key) {
            memory::entry_size(&key, &value).saturating_sub(memory::entry_size(&key, old))
        } else {
            memory::entry_size(&key, &value)
        };
        self.ensure_capacity(increase)?;

        let stamp = self.touch_mvcc();
        if !value.is_shared() {
            value.object().set_mvcc(stamp);
            evict::init_clock_word(
                value.object(),
                self.config.eviction_policy,
                time::now_ms(),
            );
        }

        let inserted = match self.primary.insert(key.clone(), value.clone(), assume_new) {
            InsertOutcome::Inserted => {
                self.memory.add(&key, &value);
                // a re-insert after a delete-under-snapshot revives the
                // key; the tombstone no longer applies
                self.tombstone.remove(&key);
                if !keeps_ttl && had_ttl {
                    self.drop_whole_key_expire(&key);
                }
                true
            }
            InsertOutcome::Exists(slot) => {
                let old = std::mem::replace(slot, value.clone());
                self.memory.replace(&key, &old, &value);
                self.defer_drop(old);
                if !keeps_ttl && had_ttl {
                    self.drop_whole_key_expire(&key);
                }
                false
            }
        };
        if keeps_ttl {
            value.set_has_expire(true);
        }

        self.record_dirty(key.clone());
        self.store_through(&key);
        self.events.emit(Event::KeyInserted {
            db: self.config.index,
            key,
            value,
            expire_ms: None,
        });
        Ok(inserted)
    }

    /// Replaces the value bound to `key`, which must be resident.
    ///
    /// `update_mvcc` stamps the new value with a fresh clock reading;
    /// read-through promotion and merge paths pass `false` to preserve
    /// the stamp already on the value. `remove_expire` additionally
    /// drops any whole-key TTL.
    pub fn update_value(
        &mut self,
        key: &[u8],
        mut value: ObjRef,
        update_mvcc: bool,
        remove_expire: bool,
    ) -> Result<(), EngineError> {
        let had_ttl = self.expires.contains_key(key);
        if had_ttl && !remove_expire && value.is_shared() {
            // the surviving TTL needs the expire bit, which shared
            // singletons refuse
            value = value.owned_copy();
        }
        if update_mvcc {
            let stamp = self.touch_mvcc();
            if !value.is_shared() {
                value.object().set_mvcc(stamp);
            }
        }
        let slot = self.primary.get_mut(key).ok_or(EngineError::KeyNotFound)?;
        let old = std::mem::replace(slot, value.clone());
        if had_ttl && !remove_expire {
            value.set_has_expire(true);
        }
        self.memory.replace(key, &old, &value);
        self.defer_drop(old);
        if remove_expire && had_ttl {
            self.drop_whole_key_expire(&Bytes::copy_from_slice(key));
        }
        let key = Bytes::copy_from_slice(key);
        self.record_dirty(key.clone());
        self.store_through(&key);
        Ok(())
    }

    /// Clears a whole-key TTL, fixing up the value's expire bit and the
    /// provider's expire record.
    fn drop_whole_key_expire(&mut self, key: &Bytes) {
        let Some(when) = self.expires.get(key, None) else {
            return;
        };
        self.expires.remove(key, None);
        if !self.expires.any_for_key(key) {
            if let Some(value) = self.primary.get(key) {
                value.set_has_expire(false);
            }
        }
        if let Some(cache) = &self.storage {
            cache.remove_expire(key, when as i64);
        }
    }

    /// Removes `key`, dropping the value inline. Returns whether a
    /// removal was observable at any layer.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.delete_inner(key, DeleteReason::User, false)
    }

    /// Removes `key`, deferring destructor work to the reclamation
    /// thread. Same observable result as [`Database::delete`].
    pub fn delete_async(&mut self, key: &[u8]) -> bool {
        self.delete_inner(key, DeleteReason::User, true)
    }

    pub(crate) fn delete_inner(
        &mut self,
        key: &[u8],
        reason: DeleteReason,
        deferred: bool,
    ) -> bool {
        let removed = self.primary.remove(key);
        let chain_value = self.chain_lookup(key);
        let chain_has = chain_value.is_some();
        // storage deletes are synchronous in every memory model: a
        // deferred erase would let read-through resurrect the key
        let storage_had = match &self.storage {
            Some(cache) => cache.erase(key),
            None => false,
        };

        let key_bytes = match &removed {
            Some((k, _)) => k.clone(),
            None => Bytes::copy_from_slice(key),
        };
        if let Some((_, value)) = removed {
            self.memory.remove(key, &value);
            if deferred {
                if let Some(handle) = &self.drop_handle {
                    handle.defer_value_always(value);
                }
            }
            // sync path: value drops here
        } else if let Some(shadowed) = &chain_value {
            // the binding lives only in the snapshot chain; account for
            // it now, since the tombstoned copy is dropped at collapse
            self.memory.remove(key, shadowed);
        } else if !storage_had {
            return false;
        }

        if chain_has && self.snapshot.is_some() {
            self.tombstone.insert(key_bytes.clone(), (), false);
        }
        self.expires.remove_all_for_key(key);
        self.record_dirty(key_bytes.clone());
        self.touch_mvcc();
        match reason {
            DeleteReason::Expired => self.expired_total += 1,
            DeleteReason::Evicted => self.evicted_total += 1,
            _ => {}
        }
        self.events.emit(Event::KeyDeleted {
            db: self.config.index,
            key: key_bytes,
            reason,
        });
        true
    }

    /// Empties the database. With `async_drop` the bulk of the
    /// destructor work moves to the reclamation thread.
    pub fn clear(&mut self, async_drop: bool) {
        let old_primary = std::mem::take(&mut self.primary);
        let old_tombstone = std::mem::take(&mut self.tombstone);
        // the chain no longer backs the live layer; released levels
        // are collected once their readers finish
        self.snapshot = None;

        old_primary.iterate(&mut |key, _| {
            self.events.emit(Event::KeyDeleted {
                db: self.config.index,
                key: key.clone(),
                reason: DeleteReason::Flushed,
            });
            true
        });

        self.expires.clear();
        self.memory.reset();
        self.dirty.take();
        self.pending = PendingFlush::default();
        self.pool.clear();
        if let Some(cache) = &self.storage {
            cache.clear();
        }
        self.touch_mvcc();

        match (&self.drop_handle, async_drop) {
            (Some(handle), true) => {
                handle.defer_table(old_primary);
                handle.defer_tombstones(old_tombstone);
            }
            _ => drop((old_primary, old_tombstone)),
        }
    }

    // -----------------------------------------------------------------
    // expiration
    // -----------------------------------------------------------------

    /// Attaches an absolute expiration to `key` (whole-key when
    /// `subkey` is `None`).
    pub fn set_expire(
        &mut self,
        key: &[u8],
        subkey: Option<Bytes>,
        when_ms: u64,
    ) -> Result<(), EngineError> {
        if self.expire_if_needed(key) {
            return Err(EngineError::KeyNotFound);
        }
        self.ensure_resident(key);
        if !self.primary.contains(key) {
            return Err(EngineError::KeyNotFound);
        }
        // shared singletons can't carry the expire bit; rebind an
        // owned copy first
        if self.primary.get(key).is_some_and(|v| v.is_shared()) {
            let slot = self.primary.get_mut(key).expect("checked above");
            *slot = slot.owned_copy();
        }
        let value = self.primary.get(key).expect("checked above").clone();
        value.set_has_expire(true);

        let key_bytes = Bytes::copy_from_slice(key);
        self.expires.set(key_bytes.clone(), subkey, when_ms);
        if let Some(cache) = &self.storage {
            cache.set_expire(key, when_ms as i64);
        }
        self.record_dirty(key_bytes);
        self.touch_mvcc();
        Ok(())
    }

    /// Drops the expiration for `(key, subkey)`. Returns whether one
    /// existed.
    pub fn remove_expire(&mut self, key: &[u8], subkey: Option<&[u8]>) -> bool {
        let prior = self.expires.get(key, subkey);
        if !self.expires.remove(key, subkey) {
            return false;
        }
        if !self.expires.any_for_key(key) {
            if let Some(value) = self.primary.get(key) {
                value.set_has_expire(false);
            }
        }
        if let (Some(cache), Some(when)) = (&self.storage, prior) {
            cache.remove_expire(key, when as i64);
        }
        self.record_dirty(Bytes::copy_from_slice(key));
        self.touch_mvcc();
        true
    }

    /// The whole-key expire time, if set.
    pub fn expire_time(&self, key: &[u8]) -> Option<u64> {
        self.expires.get(key, None)
    }

    /// Lazy expiration: deletes `key` when its whole-key TTL has
    /// passed. Replicas report the key as gone but keep the data until
    /// the primary's delete arrives. Returns whether the key is
    /// logically expired.
    pub(crate) fn expire_if_needed(&mut self, key: &[u8]) -> bool {
        let Some(when) = self.expires.get(key, None) else {
            return false;
        };
        if time::now_ms() < when {
            return false;
        }
        if self.config.replica {
            return true;
        }
        self.delete_inner(key, DeleteReason::Expired, false);
        true
    }

    /// Removes an expired subkey from its collection value and emits
    /// the subkey event. Used by the active-expire cycle.
    pub(crate) fn expire_subkey(&mut self, key: &[u8], subkey: &Bytes, when_ms: u64) {
        if !self.expires.remove(key, Some(subkey)) {
            return;
        }
        self.ensure_resident(key);
        if let Some(slot) = self.primary.get_mut(key) {
            if !slot.is_shared() {
                match slot.payload_mut() {
                    Payload::Hash(fields) => {
                        fields.remove(subkey);
                    }
                    Payload::Set(members) => {
                        members.remove(subkey);
                    }
                    _ => {}
                }
            }
        }
        if !self.expires.any_for_key(key) {
            if let Some(value) = self.primary.get(key) {
                value.set_has_expire(false);
            }
        }
        let key_bytes = Bytes::copy_from_slice(key);
        self.record_dirty(key_bytes.clone());
        self.touch_mvcc();
        self.events.emit(Event::SubkeyExpired {
            db: self.config.index,
            key: key_bytes,
            subkey: subkey.clone(),
            when_ms,
        });
    }

    // -----------------------------------------------------------------
    // change tracking and storage flush
    // -----------------------------------------------------------------

    /// Opens a change-tracking scope. `bulk` pre-sizes the dirty set.
    pub fn track_changes(&mut self, bulk: bool, size_hint: usize) {
        self.tracking_depth += 1;
        if bulk {
            self.dirty.reserve(size_hint);
        }
    }

    pub fn tracking_changes(&self) -> bool {
        self.tracking_depth > 0
    }

    /// Drains the dirty set and serialises the affected bindings into
    /// the pending flush. Returns whether commit work is queued.
    ///
    /// `snapshot_on_flush` is accepted for callers that want flush
    /// isolation; serialisation happens eagerly here under the writer
    /// lock, which gives the same point-in-time guarantee.
    pub fn process_changes(&mut self, _snapshot_on_flush: bool) -> bool {
        self.tracking_depth = self.tracking_depth.saturating_sub(1);
        let (all_changed, keys) = self.dirty.take();
        if self.storage.is_none() {
            return false;
        }
        if self.config.memory_model == MemoryModel::WriteThrough {
            // writes already reached the provider inline
            return !self.pending.is_empty();
        }

        if all_changed {
            self.pending.clear_first = true;
            self.pending.puts.clear();
            self.pending.dels.clear();
            let mut puts = Vec::new();
            let expires = &self.expires;
            self.iterate(&mut |key, value| {
                let record = serial::serialize(value.object(), expires.get(key, None));
                puts.push((key.clone(), record));
                true
            });
            self.pending.puts = puts;
        } else {
            for key in keys {
                match self.resolve(&key) {
                    Some(value) => {
                        let record =
                            serial::serialize(value.object(), self.expires.get(&key, None));
                        self.pending.puts.push((key, record));
                    }
                    None => self.pending.dels.push(key),
                }
            }
        }
        !self.pending.is_empty()
    }

    /// Replays the pending flush into the provider under one batch.
    /// A no-op when nothing is queued.
    pub fn commit_changes(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        let Some(cache) = &self.storage else {
            return;
        };
        cache.begin_batch();
        if pending.clear_first {
            cache.clear();
        }
        for (key, record) in &pending.puts {
            cache.insert(key, record, true);
        }
        for key in &pending.dels {
            cache.erase(key);
        }
        cache.end_batch();
        debug!(
            db = self.config.index,
            puts = pending.puts.len(),
            dels = pending.dels.len(),
            "flushed changes to storage"
        );
    }

    /// Resolution without promotion, used by the flush path.
    pub(crate) fn resolve(&self, key: &[u8]) -> Option<ObjRef> {
        if let Some(value) = self.primary.get(key) {
            return Some(value.clone());
        }
        if self.tombstone.contains(key) {
            return None;
        }
        self.chain_lookup(key)
    }

    fn record_dirty(&mut self, key: Bytes) {
        // write-through pushes state inline, so the dirty set only
        // matters for explicit tracking scopes and write-back flushes
        let write_back =
            self.storage.is_some() && self.config.memory_model == MemoryModel::WriteBack;
        if self.tracking_depth > 0 || write_back {
            self.dirty.record(key);
        }
    }

    /// Write-through: serialise the key's current state straight into
    /// the provider.
    fn store_through(&mut self, key: &Bytes) {
        if self.config.memory_model != MemoryModel::WriteThrough {
            return;
        }
        let Some(value) = self.resolve(key) else {
            return;
        };
        let record = serial::serialize(value.object(), self.expires.get(key, None));
        if let Some(cache) = &self.storage {
            cache.insert(key, &record, true);
        }
    }

    /// Inserts raw serialised records straight into the provider,
    /// bypassing the in-memory layer. Bulk-load path.
    pub fn bulk_storage_insert(&mut self, items: &[(Bytes, Bytes)]) -> Result<(), EngineError> {
        let Some(cache) = &self.storage else {
            return Err(EngineError::InvalidArgument(
                "no storage provider attached".into(),
            ));
        };
        cache.bulk_insert(items);
        Ok(())
    }

    // -----------------------------------------------------------------
    // cold-key cache control
    // -----------------------------------------------------------------

    /// Drops a clean resident binding from memory, leaving the
    /// provider copy authoritative. Returns whether a spill happened.
    pub fn remove_cached_value(&mut self, key: &[u8]) -> bool {
        if self.storage.is_none() || self.dirty.contains(key) {
            return false;
        }
        match self.primary.remove(key) {
            Some((_, value)) => {
                self.memory.remove(key, &value);
                self.defer_drop(value);
                true
            }
            None => false,
        }
    }

    /// Spills every clean resident binding back to the provider copy.
    pub fn remove_all_cached_values(&mut self) {
        if self.storage.is_none() {
            return;
        }
        let keys: Vec<Bytes> = self
            .primary
            .iter()
            .filter(|(k, _)| !self.dirty.contains(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.remove_cached_value(&key);
        }
    }

    /// Stops read-through from populating the in-memory table; lookups
    /// still reach the provider, values are just not retained.
    pub fn disable_key_cache(&mut self) {
        self.key_cache_enabled = false;
    }

    pub fn key_cache_enabled(&self) -> bool {
        self.key_cache_enabled
    }

    // -----------------------------------------------------------------
    // eviction support
    // -----------------------------------------------------------------

    pub(crate) fn eviction_pool_mut(&mut self) -> &mut EvictionPool {
        &mut self.pool
    }

    /// Random resident keys: all keys, or only those carrying an
    /// expiration under a volatile policy.
    pub(crate) fn sample_keys(&self, volatile_only: bool, n: usize) -> SmallVec<[Bytes; 8]> {
        if volatile_only {
            self.expires
                .random_sample(n)
                .into_iter()
                .filter(|e| e.subkey.is_none())
                .map(|e| e.key)
                .collect()
        } else {
            let mut rng = rand::rng();
            let mut keys = SmallVec::new();
            for _ in 0..n {
                if let Some((key, _)) = self.primary.random_entry(&mut rng) {
                    keys.push(key.clone());
                }
            }
            keys
        }
    }

    /// Evicts `key` outright, emitting the eviction event.
    pub(crate) fn evict_key(&mut self, key: &[u8], reason: DeleteReason) -> bool {
        self.delete_inner(key, reason, true)
    }

    /// Prefers spilling the clean in-memory copy; falls back to a full
    /// eviction when the key has unflushed changes.
    pub(crate) fn spill_or_evict(&mut self, key: &[u8]) -> bool {
        if self.remove_cached_value(key) {
            return true;
        }
        self.evict_key(key, DeleteReason::Evicted)
    }

    pub(crate) fn storage_eviction_candidates(&self, count: usize) -> Option<Vec<Bytes>> {
        self.storage.as_ref().map(|c| c.eviction_candidates(count))
    }

    /// Frees memory until `increase` more bytes fit under the cap.
    fn ensure_capacity(&mut self, increase: usize) -> Result<(), EngineError> {
        let Some(max) = self.config.max_memory else {
            return Ok(());
        };
        let limit = memory::effective_limit(max);
        let now = time::now_ms();
        while self.memory.used_bytes() + increase > limit {
            if !evict::evict_one(self, now)? {
                return Err(EngineError::OutOfMemory);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // iteration and counting
    // -----------------------------------------------------------------

    /// Visits every live binding reachable from memory (live layer and
    /// snapshot chain; storage-resident keys not faulted in are not
    /// included — see [`Database::iterate_threadsafe`]).
    pub fn iterate(&self, f: &mut dyn FnMut(&Bytes, &ObjRef) -> bool) -> bool {
        let mut seen = ahash::AHashSet::new();
        let mut complete = true;
        complete &= self.primary.iterate(&mut |k, v| {
            seen.insert(k.clone());
            f(k, v)
        });
        if !complete {
            return false;
        }
        self.tombstone.iterate(&mut |k, _| {
            seen.insert(k.clone());
            true
        });
        let mut cur = self.snapshot;
        while let Some(id) = cur {
            let node = self.arena.node(id);
            let keep_going = node.primary.iterate(&mut |k, v| {
                if seen.insert(k.clone()) {
                    return f(k, v);
                }
                true
            });
            if !keep_going {
                return false;
            }
            node.tombstone.iterate(&mut |k, _| {
                seen.insert(k.clone());
                true
            });
            cur = node.parent;
        }
        true
    }

    /// Cursor scan over the live primary table only (resident keys).
    pub fn scan_cached(&self, cursor: u64, emit: &mut dyn FnMut(&Bytes, &ObjRef)) -> u64 {
        self.primary.scan(cursor, emit)
    }

    /// Number of live keys. With a provider attached the provider's
    /// count is authoritative; without one, a snapshot chain forces a
    /// resolution walk.
    pub fn len(&self) -> usize {
        if let Some(cache) = &self.storage {
            return cache.count();
        }
        if self.snapshot.is_none() {
            return self.primary.len();
        }
        let mut count = 0usize;
        self.iterate(&mut |_, _| {
            count += 1;
            true
        });
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of resident (cached) keys only.
    pub fn cached_len(&self) -> usize {
        self.primary.len()
    }

    /// A uniformly random resident binding.
    pub fn random_entry(&self, rng: &mut impl Rng) -> Option<(Bytes, ObjRef)> {
        self.primary
            .random_entry(rng)
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// A random resident key paired with its whole-key expire entry,
    /// when it has one.
    pub fn random_expire(&self, rng: &mut impl Rng) -> Option<ExpireEntry> {
        let (key, _) = self.primary.random_entry(rng)?;
        let when_ms = self.expires.get(key, None)?;
        Some(ExpireEntry {
            key: key.clone(),
            subkey: None,
            when_ms,
        })
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            key_count: self.len(),
            used_bytes: self.memory.used_bytes(),
            keys_with_expiry: self.expires.len(),
            expired_total: self.expired_total,
            evicted_total: self.evicted_total,
            storage_hits: self.storage_hits,
            storage_misses: self.storage_misses,
            snapshot_depth: self.snapshot_depth(),
        }
    }

    // -----------------------------------------------------------------
    // misc
    // -----------------------------------------------------------------

    /// Issues a fresh MVCC stamp and records it as this database's
    /// checkpoint. Every write path lands here exactly once.
    pub(crate) fn touch_mvcc(&mut self) -> u64 {
        let stamp = self.clock.next(time::now_ms());
        self.mvcc_checkpoint = stamp;
        stamp
    }

    /// Faults a chain- or storage-resident binding into the live
    /// primary table. No-op when already resident or truly absent.
    pub(crate) fn ensure_resident(&mut self, key: &[u8]) {
        if self.primary.contains(key) || self.tombstone.contains(key) {
            return;
        }
        if let Some(found) = self.chain_lookup(key) {
            self.primary
                .insert(Bytes::copy_from_slice(key), found, true);
            return;
        }
        if self.chain_tombstoned(key) {
            return;
        }
        self.storage_lookup(key);
    }

    pub(crate) fn defer_drop(&self, value: ObjRef) {
        if let Some(handle) = &self.drop_handle {
            handle.defer_value(value);
        }
    }
}
