//! Typed accessors over the metadata store.
//!
//! Replication state and the logical-to-storage database mapping live
//! as reserved keys in the distinguished metadata provider:
//!
//! - `repl-id` — replication identifier bytes
//! - `repl-offset` — 8-byte little-endian replication offset
//! - `repl-stream-db` — 4-byte little-endian database index
//! - `db-<N>` — storage database id for logical database N

use std::sync::Arc;

use bytes::Bytes;

use crate::Storage;

const REPL_ID_KEY: &[u8] = b"repl-id";
const REPL_OFFSET_KEY: &[u8] = b"repl-offset";
const REPL_STREAM_DB_KEY: &[u8] = b"repl-stream-db";

/// Replication and database-mapping state persisted in the metadata store.
pub struct MetadataStore {
    store: Arc<dyn Storage>,
}

impl MetadataStore {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }

    /// Persists the replication identifier.
    pub fn set_repl_id(&self, id: &[u8]) {
        self.store.insert(REPL_ID_KEY, id, true);
    }

    /// Reads the replication identifier, if one was ever written.
    pub fn repl_id(&self) -> Option<Bytes> {
        let mut out = None;
        self.store
            .retrieve(REPL_ID_KEY, &mut |v| out = Some(Bytes::copy_from_slice(v)));
        out
    }

    /// Persists the replication offset.
    pub fn set_repl_offset(&self, offset: u64) {
        self.store
            .insert(REPL_OFFSET_KEY, &offset.to_le_bytes(), true);
    }

    /// Reads the replication offset. Returns `None` when absent or the
    /// stored record is not exactly 8 bytes.
    pub fn repl_offset(&self) -> Option<u64> {
        let mut out = None;
        self.store.retrieve(REPL_OFFSET_KEY, &mut |v| {
            if let Ok(raw) = <[u8; 8]>::try_from(v) {
                out = Some(u64::from_le_bytes(raw));
            }
        });
        out
    }

    /// Persists the index of the database the replication stream selects.
    pub fn set_repl_stream_db(&self, db: u32) {
        self.store
            .insert(REPL_STREAM_DB_KEY, &db.to_le_bytes(), true);
    }

    /// Reads the replication stream database index.
    pub fn repl_stream_db(&self) -> Option<u32> {
        let mut out = None;
        self.store.retrieve(REPL_STREAM_DB_KEY, &mut |v| {
            if let Ok(raw) = <[u8; 4]>::try_from(v) {
                out = Some(u32::from_le_bytes(raw));
            }
        });
        out
    }

    /// Records that logical database `db` is backed by storage id `id`.
    pub fn set_db_mapping(&self, db: usize, id: &[u8]) {
        self.store.insert(db_key(db).as_bytes(), id, true);
    }

    /// Reads the storage id mapped to logical database `db`.
    pub fn db_mapping(&self, db: usize) -> Option<Bytes> {
        let mut out = None;
        self.store.retrieve(db_key(db).as_bytes(), &mut |v| {
            out = Some(Bytes::copy_from_slice(v));
        });
        out
    }
}

fn db_key(db: usize) -> String {
    format!("db-{db}")
}
