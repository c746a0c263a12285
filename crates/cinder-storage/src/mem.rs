//! In-memory reference provider.
//!
//! Backs tests and cache-only deployments with the same contract a disk
//! provider honours: batched writes, slot-scoped enumeration, expiration
//! and eviction candidate queries, and read-only clones. State lives in
//! a single mutex because the engine already serialises writers; the
//! lock only protects against concurrent read-only clones.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{Storage, StorageError, StorageFactory, key_slot, METADATA_DB_IDENTIFIER};

#[derive(Default)]
struct Inner {
    /// Ordered so enumeration and candidate queries are deterministic.
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Absolute expiration per key, mirrored from `set_expire`.
    expires: BTreeMap<Vec<u8>, i64>,
    batch_depth: u32,
}

/// A [`Storage`] provider held entirely in memory.
pub struct MemStorage {
    inner: Arc<Mutex<Inner>>,
    read_only: bool,
}

impl MemStorage {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            read_only: false,
        }
    }

    fn check_writable(&self) {
        assert!(!self.read_only, "write attempted on a read-only storage clone");
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStorage {
    fn insert(&self, key: &[u8], value: &[u8], overwrite: bool) {
        self.check_writable();
        let mut inner = self.inner.lock();
        let prev = inner.entries.insert(key.to_vec(), value.to_vec());
        debug_assert!(
            overwrite || prev.is_none(),
            "insert without overwrite hit an existing key"
        );
    }

    fn erase(&self, key: &[u8]) -> bool {
        self.check_writable();
        let mut inner = self.inner.lock();
        inner.expires.remove(key);
        inner.entries.remove(key).is_some()
    }

    fn retrieve(&self, key: &[u8], f: &mut dyn FnMut(&[u8])) -> bool {
        let inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    fn enumerate(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> bool {
        let inner = self.inner.lock();
        for (key, value) in &inner.entries {
            if !f(key, value) {
                return false;
            }
        }
        true
    }

    fn enumerate_hashslot(&self, slot: u16, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> bool {
        let inner = self.inner.lock();
        for (key, value) in &inner.entries {
            if key_slot(key) != slot {
                continue;
            }
            if !f(key, value) {
                return false;
            }
        }
        true
    }

    fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn expiration_candidates(&self, count: usize) -> Vec<Bytes> {
        let inner = self.inner.lock();
        let mut keyed: Vec<(i64, &Vec<u8>)> =
            inner.expires.iter().map(|(k, when)| (*when, k)).collect();
        keyed.sort();
        keyed
            .into_iter()
            .take(count)
            .map(|(_, k)| Bytes::copy_from_slice(k))
            .collect()
    }

    fn eviction_candidates(&self, count: usize) -> Vec<Bytes> {
        // no access tracking below the cache layer; oldest keys in
        // iteration order are as good a guess as any
        let inner = self.inner.lock();
        inner
            .entries
            .keys()
            .take(count)
            .map(|k| Bytes::copy_from_slice(k))
            .collect()
    }

    fn set_expire(&self, key: &[u8], when_ms: i64) {
        self.check_writable();
        self.inner.lock().expires.insert(key.to_vec(), when_ms);
    }

    fn remove_expire(&self, key: &[u8], when_ms: i64) {
        self.check_writable();
        let mut inner = self.inner.lock();
        if inner.expires.get(key) == Some(&when_ms) {
            inner.expires.remove(key);
        }
    }

    fn begin_batch(&self) {
        self.inner.lock().batch_depth += 1;
    }

    fn end_batch(&self) {
        let mut inner = self.inner.lock();
        inner.batch_depth = inner.batch_depth.saturating_sub(1);
    }

    fn clear(&self) -> usize {
        self.check_writable();
        let mut inner = self.inner.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.expires.clear();
        removed
    }

    fn flush(&self) {
        // memory-resident; nothing to sync
    }

    fn clone_readonly(&self) -> Arc<dyn Storage> {
        Arc::new(MemStorage {
            inner: Arc::clone(&self.inner),
            read_only: true,
        })
    }
}

/// Factory handing out one [`MemStorage`] per logical database index.
///
/// Database stores survive across `create` calls for the same index, so
/// a test can drop its in-memory state and "restart" against the same
/// provider contents.
#[derive(Default)]
pub struct MemStorageFactory {
    dbs: Mutex<AHashMap<usize, Arc<MemStorage>>>,
    metadata: Mutex<Option<Arc<MemStorage>>>,
}

impl MemStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageFactory for MemStorageFactory {
    fn create(
        &self,
        db: usize,
        loader: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<Arc<dyn Storage>, StorageError> {
        let store = Arc::clone(
            self.dbs
                .lock()
                .entry(db)
                .or_insert_with(|| Arc::new(MemStorage::new())),
        );
        if let Some(loader) = loader {
            store.enumerate(&mut |key, _value| {
                loader(key);
                true
            });
        }
        Ok(store)
    }

    fn create_metadata_db(&self) -> Result<Arc<dyn Storage>, StorageError> {
        let mut slot = self.metadata.lock();
        let store = match &*slot {
            Some(existing) => Arc::clone(existing),
            None => {
                let store = Arc::new(MemStorage::new());
                store.insert(
                    METADATA_DB_IDENTIFIER.as_bytes(),
                    METADATA_DB_IDENTIFIER.as_bytes(),
                    true,
                );
                *slot = Some(Arc::clone(&store));
                store
            }
        };
        Ok(store)
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn total_disk_space_used(&self) -> usize {
        0
    }

    fn is_slow(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_retrieve_round_trip() {
        let store = MemStorage::new();
        store.insert(b"k1", b"v1", false);

        let mut got = None;
        assert!(store.retrieve(b"k1", &mut |v| got = Some(v.to_vec())));
        assert_eq!(got.unwrap(), b"v1");
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn retrieve_missing_returns_false() {
        let store = MemStorage::new();
        let mut called = false;
        assert!(!store.retrieve(b"nope", &mut |_| called = true));
        assert!(!called);
    }

    #[test]
    fn erase_removes() {
        let store = MemStorage::new();
        store.insert(b"k", b"v", false);
        assert!(store.erase(b"k"));
        assert!(!store.erase(b"k"));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn enumerate_stops_early() {
        let store = MemStorage::new();
        store.insert(b"a", b"1", false);
        store.insert(b"b", b"2", false);
        store.insert(b"c", b"3", false);

        let mut seen = 0;
        let complete = store.enumerate(&mut |_, _| {
            seen += 1;
            seen < 2
        });
        assert!(!complete);
        assert_eq!(seen, 2);
    }

    #[test]
    fn enumerate_hashslot_filters() {
        let store = MemStorage::new();
        store.insert(b"x", b"1", false);
        store.insert(b"y", b"2", false);

        let slot = key_slot(b"x");
        let mut keys = Vec::new();
        store.enumerate_hashslot(slot, &mut |k, _| {
            keys.push(k.to_vec());
            true
        });
        assert!(keys.contains(&b"x".to_vec()));
        for k in &keys {
            assert_eq!(key_slot(k), slot);
        }
    }

    #[test]
    fn expiration_candidates_sorted_by_when() {
        let store = MemStorage::new();
        store.insert(b"late", b"v", false);
        store.insert(b"soon", b"v", false);
        store.set_expire(b"late", 5_000);
        store.set_expire(b"soon", 1_000);

        let candidates = store.expiration_candidates(1);
        assert_eq!(candidates, vec![Bytes::from_static(b"soon")]);
    }

    #[test]
    fn remove_expire_checks_stamp() {
        let store = MemStorage::new();
        store.insert(b"k", b"v", false);
        store.set_expire(b"k", 1_000);
        // stale stamp should not clear the newer entry
        store.remove_expire(b"k", 999);
        assert_eq!(store.expiration_candidates(1).len(), 1);
        store.remove_expire(b"k", 1_000);
        assert!(store.expiration_candidates(1).is_empty());
    }

    #[test]
    fn bulk_insert_default_impl() {
        let store = MemStorage::new();
        let items = vec![
            (Bytes::from_static(b"a"), Bytes::from_static(b"1")),
            (Bytes::from_static(b"b"), Bytes::from_static(b"2")),
        ];
        store.bulk_insert(&items);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn readonly_clone_sees_writes() {
        let store = MemStorage::new();
        let ro = store.clone_readonly();
        store.insert(b"k", b"v", false);
        assert_eq!(ro.count(), 1);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn readonly_clone_rejects_writes() {
        let store = MemStorage::new();
        let ro = store.clone_readonly();
        ro.insert(b"k", b"v", false);
    }

    #[test]
    fn factory_returns_same_store_per_db() {
        let factory = MemStorageFactory::new();
        let a = factory.create(0, None).unwrap();
        a.insert(b"k", b"v", false);

        let b = factory.create(0, None).unwrap();
        assert_eq!(b.count(), 1);

        let other = factory.create(1, None).unwrap();
        assert_eq!(other.count(), 0);
    }

    #[test]
    fn factory_loader_sees_existing_keys() {
        let factory = MemStorageFactory::new();
        let store = factory.create(0, None).unwrap();
        store.insert(b"k1", b"v", false);
        store.insert(b"k2", b"v", false);

        let mut loaded = Vec::new();
        let mut loader = |key: &[u8]| loaded.push(key.to_vec());
        factory.create(0, Some(&mut loader)).unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn metadata_db_carries_identifier() {
        let factory = MemStorageFactory::new();
        let meta = factory.create_metadata_db().unwrap();

        let mut got = None;
        meta.retrieve(METADATA_DB_IDENTIFIER.as_bytes(), &mut |v| {
            got = Some(v.to_vec());
        });
        assert_eq!(got.unwrap(), METADATA_DB_IDENTIFIER.as_bytes());
    }
}
