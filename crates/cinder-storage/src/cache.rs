//! Cache bookkeeping layered over a storage provider.
//!
//! [`StorageCache`] owns what the raw provider can't answer cheaply: an
//! exact element count maintained in lock-step with writes, and a
//! negative-lookup filter that short-circuits read-through for keys
//! recently observed to be absent. It also enforces the on-open version
//! guard so a store written by an incompatible build is refused before
//! any data is touched.

use std::sync::Arc;

use ahash::RandomState;
use parking_lot::Mutex;
use tracing::debug;

use crate::{Storage, StorageError};

/// Reserved key carrying the software version that last wrote the store.
pub const VERSION_KEY: &[u8] = b"__version__";

/// Version written by this build.
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Oldest store version this build can still read.
pub const MIN_SUPPORTED_VERSION: &str = "0.1.0";

/// Slot count for the negative-lookup filter. 4096 u16 tags costs 8 KiB
/// per database and keeps the false-positive rate under 1% for working
/// sets up to a few hundred thousand distinct misses.
const FILTER_SLOTS: usize = 4096;

/// Open-addressed table of short hashes for keys recently observed to be
/// absent from the provider. A matching tag means "provably absent since
/// the last write touching this slot"; any write to a colliding key
/// clears the slot, so staleness only ever costs one extra provider read.
struct NegativeFilter {
    slots: Vec<u16>,
    hasher: RandomState,
}

impl NegativeFilter {
    fn new() -> Self {
        Self {
            slots: vec![0; FILTER_SLOTS],
            hasher: RandomState::new(),
        }
    }

    fn slot_and_tag(&self, key: &[u8]) -> (usize, u16) {
        let h = self.hasher.hash_one(key);
        let slot = (h as usize) % FILTER_SLOTS;
        // 0 is the empty sentinel; force tags nonzero
        let tag = ((h >> 16) as u16) | 1;
        (slot, tag)
    }

    fn excludes(&self, key: &[u8]) -> bool {
        let (slot, tag) = self.slot_and_tag(key);
        self.slots[slot] == tag
    }

    fn record_miss(&mut self, key: &[u8]) {
        let (slot, tag) = self.slot_and_tag(key);
        self.slots[slot] = tag;
    }

    fn invalidate(&mut self, key: &[u8]) {
        let (slot, _) = self.slot_and_tag(key);
        self.slots[slot] = 0;
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = 0);
    }
}

struct CacheState {
    count: usize,
    filter: NegativeFilter,
}

/// A storage provider plus the bookkeeping the engine needs on top.
///
/// Cloned read-only views share the counter and filter state with the
/// writable original.
pub struct StorageCache {
    store: Arc<dyn Storage>,
    state: Arc<Mutex<CacheState>>,
    read_only: bool,
}

impl std::fmt::Debug for StorageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCache")
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl StorageCache {
    /// Opens a cache over `store`, validating the version sentinel and
    /// initialising the element counter from the provider.
    pub fn open(store: Arc<dyn Storage>) -> Result<Self, StorageError> {
        check_version(store.as_ref())?;
        // the sentinel lives alongside user keys; keep it out of the count
        let raw = store.count();
        let count = raw.saturating_sub(1);
        debug!(count, "storage cache opened");
        Ok(Self {
            store,
            state: Arc::new(Mutex::new(CacheState {
                count,
                filter: NegativeFilter::new(),
            })),
            read_only: false,
        })
    }

    /// Number of user keys in the provider.
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Looks up a key, invoking `f` with the value when present.
    ///
    /// Consults the negative filter first; a filter hit skips the
    /// provider entirely. A provider miss is recorded in the filter.
    pub fn get(&self, key: &[u8], f: &mut dyn FnMut(&[u8])) -> bool {
        {
            let state = self.state.lock();
            if state.filter.excludes(key) {
                return false;
            }
        }
        let found = self.store.retrieve(key, f);
        if !found {
            self.state.lock().filter.record_miss(key);
        }
        found
    }

    /// Stores a serialised value. `overwrite` signals the key may
    /// already exist; without it the caller asserts the key is new.
    pub fn insert(&self, key: &[u8], value: &[u8], overwrite: bool) {
        assert!(!self.read_only, "write on read-only storage cache");
        let existed = overwrite && self.store.retrieve(key, &mut |_| {});
        self.store.insert(key, value, overwrite);
        let mut state = self.state.lock();
        if !existed {
            state.count += 1;
        }
        state.filter.invalidate(key);
    }

    /// Removes a key. Returns whether the provider held it.
    pub fn erase(&self, key: &[u8]) -> bool {
        assert!(!self.read_only, "write on read-only storage cache");
        let removed = self.store.erase(key);
        let mut state = self.state.lock();
        if removed {
            state.count = state.count.saturating_sub(1);
        }
        state.filter.invalidate(key);
        removed
    }

    /// Visits every user key-value pair (the version sentinel is hidden).
    pub fn enumerate(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> bool {
        self.store.enumerate(&mut |key, value| {
            if key == VERSION_KEY {
                return true;
            }
            f(key, value)
        })
    }

    /// Visits user pairs within one hash slot.
    pub fn enumerate_hashslot(&self, slot: u16, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> bool {
        self.store.enumerate_hashslot(slot, &mut |key, value| {
            if key == VERSION_KEY {
                return true;
            }
            f(key, value)
        })
    }

    /// Inserts many pairs through the provider's bulk path.
    pub fn bulk_insert(&self, items: &[(bytes::Bytes, bytes::Bytes)]) {
        assert!(!self.read_only, "write on read-only storage cache");
        self.store.bulk_insert(items);
        let mut state = self.state.lock();
        state.count += items.len();
        for (key, _) in items {
            state.filter.invalidate(key);
        }
    }

    /// Provider's expiration candidates, see [`Storage::expiration_candidates`].
    pub fn expiration_candidates(&self, count: usize) -> Vec<bytes::Bytes> {
        self.store.expiration_candidates(count)
    }

    /// Provider's eviction candidates, see [`Storage::eviction_candidates`].
    /// The version sentinel is never offered up.
    pub fn eviction_candidates(&self, count: usize) -> Vec<bytes::Bytes> {
        self.store
            .eviction_candidates(count + 1)
            .into_iter()
            .filter(|k| k.as_ref() != VERSION_KEY)
            .take(count)
            .collect()
    }

    /// Mirrors a key's absolute expiration down to the provider.
    pub fn set_expire(&self, key: &[u8], when_ms: i64) {
        self.store.set_expire(key, when_ms);
    }

    /// Clears a key's expiration in the provider.
    pub fn remove_expire(&self, key: &[u8], when_ms: i64) {
        self.store.remove_expire(key, when_ms);
    }

    /// Opens a provider write batch.
    pub fn begin_batch(&self) {
        self.store.begin_batch();
    }

    /// Closes the provider write batch.
    pub fn end_batch(&self) {
        self.store.end_batch();
    }

    /// Removes every user key. Returns how many were removed.
    pub fn clear(&self) -> usize {
        assert!(!self.read_only, "write on read-only storage cache");
        let removed = self.store.clear();
        let mut state = self.state.lock();
        state.count = 0;
        state.filter.clear();
        // the version sentinel went with everything else; restore it
        drop(state);
        self.store
            .insert(VERSION_KEY, CURRENT_VERSION.as_bytes(), true);
        removed.saturating_sub(1)
    }

    /// Flushes pending provider writes to durable media.
    pub fn flush(&self) {
        self.store.flush();
    }

    /// A read-only view sharing counter and filter state, safe to hand
    /// to a background flush or save worker.
    pub fn clone_readonly(&self) -> StorageCache {
        StorageCache {
            store: self.store.clone_readonly(),
            state: Arc::clone(&self.state),
            read_only: true,
        }
    }
}

/// Validates the version sentinel, writing or refreshing it as needed.
fn check_version(store: &dyn Storage) -> Result<(), StorageError> {
    let mut found: Option<Vec<u8>> = None;
    store.retrieve(VERSION_KEY, &mut |v| found = Some(v.to_vec()));

    let found = match found {
        None => {
            // fresh store: stamp it and move on
            store.insert(VERSION_KEY, CURRENT_VERSION.as_bytes(), true);
            return Ok(());
        }
        Some(raw) => String::from_utf8(raw)
            .map_err(|e| StorageError::MalformedVersion(e.to_string()))?,
    };

    let found_v = parse_version(&found)?;
    let current_v = parse_version(CURRENT_VERSION)?;
    let minimum_v = parse_version(MIN_SUPPORTED_VERSION)?;

    if found_v > current_v {
        return Err(StorageError::IncompatibleVersion {
            found,
            current: CURRENT_VERSION.into(),
        });
    }
    if found_v < minimum_v {
        return Err(StorageError::UnsupportedLegacyVersion {
            found,
            minimum: MIN_SUPPORTED_VERSION.into(),
        });
    }
    if found_v < current_v {
        debug!(from = %found, to = CURRENT_VERSION, "upgrading storage version sentinel");
        store.insert(VERSION_KEY, CURRENT_VERSION.as_bytes(), true);
    }
    Ok(())
}

/// Parses a `major.minor.patch` version string into a comparable triple.
fn parse_version(s: &str) -> Result<(u32, u32, u32), StorageError> {
    let mut parts = s.split('.');
    let mut next = || -> Result<u32, StorageError> {
        parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| StorageError::MalformedVersion(s.into()))
    };
    let triple = (next()?, next()?, next()?);
    if parts.next().is_some() {
        return Err(StorageError::MalformedVersion(s.into()));
    }
    Ok(triple)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStorage;

    fn open_cache() -> StorageCache {
        StorageCache::open(Arc::new(MemStorage::new())).unwrap()
    }

    #[test]
    fn fresh_store_gets_version_stamp() {
        let store = Arc::new(MemStorage::new());
        let _cache = StorageCache::open(Arc::clone(&store) as Arc<dyn Storage>).unwrap();

        let mut version = None;
        store.retrieve(VERSION_KEY, &mut |v| version = Some(v.to_vec()));
        assert_eq!(version.unwrap(), CURRENT_VERSION.as_bytes());
    }

    #[test]
    fn newer_store_is_refused() {
        let store = Arc::new(MemStorage::new());
        store.insert(VERSION_KEY, b"999.0.0", true);
        let err = StorageCache::open(store as Arc<dyn Storage>).unwrap_err();
        assert!(matches!(err, StorageError::IncompatibleVersion { .. }));
    }

    #[test]
    fn legacy_store_is_refused() {
        let store = Arc::new(MemStorage::new());
        store.insert(VERSION_KEY, b"0.0.1", true);
        let err = StorageCache::open(store as Arc<dyn Storage>).unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedLegacyVersion { .. }));
    }

    #[test]
    fn garbage_version_is_refused() {
        let store = Arc::new(MemStorage::new());
        store.insert(VERSION_KEY, b"not-a-version", true);
        let err = StorageCache::open(store as Arc<dyn Storage>).unwrap_err();
        assert!(matches!(err, StorageError::MalformedVersion(_)));
    }

    #[test]
    fn count_tracks_inserts_and_erases() {
        let cache = open_cache();
        assert_eq!(cache.count(), 0);

        cache.insert(b"a", b"1", false);
        cache.insert(b"b", b"2", false);
        assert_eq!(cache.count(), 2);

        // overwrite does not bump the count
        cache.insert(b"a", b"3", true);
        assert_eq!(cache.count(), 2);

        assert!(cache.erase(b"a"));
        assert_eq!(cache.count(), 1);
        assert!(!cache.erase(b"a"));
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn count_survives_reopen() {
        let store = Arc::new(MemStorage::new());
        {
            let cache = StorageCache::open(Arc::clone(&store) as Arc<dyn Storage>).unwrap();
            cache.insert(b"a", b"1", false);
            cache.insert(b"b", b"2", false);
        }
        let cache = StorageCache::open(store as Arc<dyn Storage>).unwrap();
        assert_eq!(cache.count(), 2);
    }

    #[test]
    fn negative_filter_skips_repeated_misses() {
        let cache = open_cache();

        let mut calls = 0;
        assert!(!cache.get(b"ghost", &mut |_| calls += 1));
        assert!(!cache.get(b"ghost", &mut |_| calls += 1));
        assert_eq!(calls, 0);
        // second lookup never reached the provider
        assert!(cache.state.lock().filter.excludes(b"ghost"));
    }

    #[test]
    fn insert_clears_negative_entry() {
        let cache = open_cache();
        assert!(!cache.get(b"k", &mut |_| {}));
        assert!(cache.state.lock().filter.excludes(b"k"));

        cache.insert(b"k", b"v", false);
        let mut got = None;
        assert!(cache.get(b"k", &mut |v| got = Some(v.to_vec())));
        assert_eq!(got.unwrap(), b"v");
    }

    #[test]
    fn enumerate_hides_version_sentinel() {
        let cache = open_cache();
        cache.insert(b"user-key", b"v", false);

        let mut keys = Vec::new();
        cache.enumerate(&mut |k, _| {
            keys.push(k.to_vec());
            true
        });
        assert_eq!(keys, vec![b"user-key".to_vec()]);
    }

    #[test]
    fn clear_resets_count_and_restamps_version() {
        let cache = open_cache();
        cache.insert(b"a", b"1", false);
        cache.insert(b"b", b"2", false);

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.count(), 0);

        // sentinel is back so a reopen still validates
        let mut version = None;
        cache
            .store
            .retrieve(VERSION_KEY, &mut |v| version = Some(v.to_vec()));
        assert_eq!(version.unwrap(), CURRENT_VERSION.as_bytes());
    }

    #[test]
    fn readonly_clone_shares_state() {
        let cache = open_cache();
        cache.insert(b"a", b"1", false);

        let ro = cache.clone_readonly();
        assert_eq!(ro.count(), 1);

        let mut got = None;
        assert!(ro.get(b"a", &mut |v| got = Some(v.to_vec())));
        assert_eq!(got.unwrap(), b"1");
    }

    #[test]
    fn bulk_insert_updates_count() {
        let cache = open_cache();
        let items = vec![
            (bytes::Bytes::from_static(b"a"), bytes::Bytes::from_static(b"1")),
            (bytes::Bytes::from_static(b"b"), bytes::Bytes::from_static(b"2")),
        ];
        cache.bulk_insert(&items);
        assert_eq!(cache.count(), 2);
    }
}
