//! cinder-storage: the storage-provider boundary.
//!
//! Defines the [`Storage`] and [`StorageFactory`] traits the engine core
//! consumes, the [`StorageCache`] that fronts a provider with an element
//! counter and a negative-lookup filter, byte-level format primitives,
//! and an in-memory reference provider used by tests and cache-only
//! deployments.

pub mod cache;
pub mod format;
pub mod mem;
pub mod meta;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

pub use cache::{StorageCache, CURRENT_VERSION, MIN_SUPPORTED_VERSION, VERSION_KEY};
pub use mem::{MemStorage, MemStorageFactory};

/// Identifier written into the metadata database at construction so a
/// store opened later can be recognised as a cinder metadata store.
pub const METADATA_DB_IDENTIFIER: &str = "4f2c9b1e-a8d3-47c6-9e05-b17d204c8aa1";

/// Number of hash slots keys are bucketed into for slot-scoped
/// enumeration. Matches the Redis cluster slot count so slot-scoped
/// dumps line up with slot ownership.
pub const HASH_SLOTS: u16 = 16384;

/// Errors raised at the storage boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store was written by a newer software version.
    #[error("storage version {found} is newer than this build ({current})")]
    IncompatibleVersion { found: String, current: String },

    /// The store predates the oldest format this build can migrate.
    #[error("storage version {found} is older than the supported minimum ({minimum})")]
    UnsupportedLegacyVersion { found: String, minimum: String },

    /// The version sentinel could not be parsed.
    #[error("malformed version sentinel: {0:?}")]
    MalformedVersion(String),

    /// A write was issued against a read-only clone.
    #[error("write attempted on a read-only storage clone")]
    ReadOnly,

    /// The provider reported an internal failure.
    #[error("storage provider error: {0}")]
    Provider(String),
}

/// A persistent key-value provider underneath one logical database.
///
/// Implementations serialise batches internally; the engine only holds
/// its coordination lock around the `begin_batch`/`end_batch` pair.
/// All keys and values are opaque bytes — the engine owns the codec.
pub trait Storage: Send + Sync {
    /// Stores a key-value pair. When `overwrite` is false the caller
    /// asserts the key is new, which lets providers skip a read.
    fn insert(&self, key: &[u8], value: &[u8], overwrite: bool);

    /// Removes a key. Returns whether it existed.
    fn erase(&self, key: &[u8]) -> bool;

    /// Looks up a key, invoking `f` with the value when present.
    /// Returns whether the key was found.
    fn retrieve(&self, key: &[u8], f: &mut dyn FnMut(&[u8])) -> bool;

    /// Visits every key-value pair. The callback returns `false` to stop
    /// early; the method returns whether the walk ran to completion.
    fn enumerate(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> bool;

    /// Like [`Storage::enumerate`] but restricted to keys hashing to
    /// one slot.
    fn enumerate_hashslot(&self, slot: u16, f: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> bool;

    /// Number of keys currently stored.
    fn count(&self) -> usize;

    /// Inserts many pairs at once. The default wraps per-key inserts in
    /// a batch; providers with a native bulk path should override.
    fn bulk_insert(&self, items: &[(Bytes, Bytes)]) {
        self.begin_batch();
        for (key, value) in items {
            self.insert(key, value, false);
        }
        self.end_batch();
    }

    /// Up to `count` keys the provider considers closest to expiring.
    fn expiration_candidates(&self, count: usize) -> Vec<Bytes>;

    /// Up to `count` keys the provider considers cheapest to evict.
    fn eviction_candidates(&self, count: usize) -> Vec<Bytes>;

    /// Records an absolute expiration for a key so the provider can
    /// answer candidate queries.
    fn set_expire(&self, key: &[u8], when_ms: i64);

    /// Clears a previously recorded expiration.
    fn remove_expire(&self, key: &[u8], when_ms: i64);

    /// Opens a write batch. Calls may nest; only the outermost pair
    /// delimits the atomic unit.
    fn begin_batch(&self) {}

    /// Closes the current write batch.
    fn end_batch(&self) {}

    /// Removes every key. Returns how many were removed.
    fn clear(&self) -> usize;

    /// Forces pending writes down to durable media.
    fn flush(&self);

    /// Produces a read-only view sharing the provider's current state,
    /// usable from other threads while the original keeps writing.
    fn clone_readonly(&self) -> Arc<dyn Storage>;
}

/// Produces [`Storage`] instances: one per logical database plus a
/// distinguished metadata store for replication state.
pub trait StorageFactory: Send + Sync {
    /// Opens (or creates) the provider backing logical database `db`.
    /// `loader` is invoked once per existing key so the engine can
    /// rebuild in-memory bookkeeping.
    fn create(
        &self,
        db: usize,
        loader: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<Arc<dyn Storage>, StorageError>;

    /// Opens the metadata store. Implementations write
    /// [`METADATA_DB_IDENTIFIER`] under the key of the same name at
    /// construction.
    fn create_metadata_db(&self) -> Result<Arc<dyn Storage>, StorageError>;

    /// Short provider name for logs and INFO output.
    fn name(&self) -> &'static str;

    /// Total bytes of backing media in use across all databases.
    fn total_disk_space_used(&self) -> usize;

    /// Whether reads are slow enough that the engine should prefetch
    /// and batch aggressively.
    fn is_slow(&self) -> bool;
}

/// Maps a key to its hash slot. Deterministic across processes so
/// slot-scoped enumeration agrees with cluster slot ownership.
pub fn key_slot(key: &[u8]) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    (hasher.finalize() % HASH_SLOTS as u32) as u16
}
