//! The engine: all logical databases plus the process-wide clocks.
//!
//! Owns the database vector, the MVCC clock, the event sink, the
//! background reclamation handle, and the periodic driver. The
//! embedding server serialises mutating calls with its coordination
//! lock; everything here assumes a single writer at a time.

use std::sync::Arc;

use tracing::info;

use cinder_storage::meta::MetadataStore;
use cinder_storage::{StorageCache, StorageFactory};

use crate::config::Config;
use crate::db::Database;
use crate::driver::Driver;
use crate::dropper::DropHandle;
use crate::error::EngineError;
use crate::events::EventSink;
use crate::mvcc::MvccClock;
use crate::time::CachedClock;

/// The assembled keyspace engine.
pub struct Engine {
    config: Config,
    dbs: Vec<Database>,
    clock: CachedClock,
    mvcc: Arc<MvccClock>,
    events: EventSink,
    driver: Driver,
    metadata: Option<MetadataStore>,
    storage_factory: Option<Arc<dyn StorageFactory>>,
}

impl Engine {
    /// Builds a memory-only engine.
    pub fn new(config: Config) -> Self {
        let mvcc = Arc::new(MvccClock::new());
        let events = EventSink::new();
        let drop_handle = DropHandle::spawn();
        let dbs = (0..config.databases)
            .map(|i| {
                let mut db =
                    Database::new(config.db_config(i), Arc::clone(&mvcc), events.clone());
                db.set_drop_handle(drop_handle.clone());
                db
            })
            .collect();
        Self {
            config,
            dbs,
            clock: CachedClock::new(),
            mvcc,
            events,
            driver: Driver::new(),
            metadata: None,
            storage_factory: None,
        }
    }

    /// Builds an engine backed by a storage provider: one store per
    /// database plus the metadata store carrying replication state and
    /// the logical-to-storage mapping.
    pub fn with_storage(
        config: Config,
        factory: Arc<dyn StorageFactory>,
    ) -> Result<Self, EngineError> {
        let mut engine = Self::new(config);
        let metadata = MetadataStore::new(factory.create_metadata_db()?);
        for (i, db) in engine.dbs.iter_mut().enumerate() {
            let store = factory.create(i, None)?;
            let cache = StorageCache::open(store)?;
            db.attach_storage(cache);
            metadata.set_db_mapping(i, format!("{}-{i}", factory.name()).as_bytes());
        }
        info!(
            provider = factory.name(),
            databases = engine.dbs.len(),
            "storage provider attached"
        );
        engine.metadata = Some(metadata);
        engine.storage_factory = Some(factory);
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database_count(&self) -> usize {
        self.dbs.len()
    }

    /// Borrows logical database `index`.
    pub fn db(&self, index: usize) -> &Database {
        &self.dbs[index]
    }

    /// Mutably borrows logical database `index`.
    pub fn db_mut(&mut self, index: usize) -> &mut Database {
        &mut self.dbs[index]
    }

    /// The process-wide MVCC clock.
    pub fn mvcc(&self) -> &Arc<MvccClock> {
        &self.mvcc
    }

    /// The shared event sink; subscribe for keyspace notifications.
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Replication and mapping state, present when storage is attached.
    pub fn metadata(&self) -> Option<&MetadataStore> {
        self.metadata.as_ref()
    }

    /// Runs one periodic maintenance tick.
    pub fn tick(&mut self) {
        self.driver
            .tick(&mut self.dbs, &self.config, &self.clock, &self.mvcc);

        // storage over its cap: delete provider-chosen candidates
        if let (Some(max), Some(factory)) = (self.config.max_storage, &self.storage_factory) {
            if factory.total_disk_space_used() > max {
                for db in &mut self.dbs {
                    crate::evict::evict_storage_candidates(db, 16);
                }
            }
        }
    }

    /// Marks a background-save fork child as alive or gone.
    pub fn set_fork_child(&mut self, active: bool) {
        self.driver.set_fork_child(&mut self.dbs, active);
    }

    /// Flushes every database's pending changes to storage. The final
    /// flush on shutdown calls this after in-flight work drains.
    pub fn flush_all_changes(&mut self) {
        for db in &mut self.dbs {
            if db.process_changes(false) {
                db.commit_changes();
            }
        }
    }

    /// Storage footprint across all databases, as the factory reports.
    pub fn storage_bytes_used(&self) -> usize {
        self.storage_factory
            .as_ref()
            .map(|f| f.total_disk_space_used())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cinder_storage::MemStorageFactory;

    use crate::value::ObjRef;

    #[test]
    fn engine_round_trip() {
        let mut engine = Engine::new(Config::default());
        engine
            .db_mut(0)
            .insert(Bytes::from_static(b"greeting"), ObjRef::string("hello"), false, false)
            .unwrap();
        assert!(engine.db_mut(0).get(b"greeting").is_some());
        // databases are independent
        assert!(engine.db_mut(1).get(b"greeting").is_none());
    }

    #[test]
    fn storage_engine_writes_db_mappings() {
        let factory = Arc::new(MemStorageFactory::new());
        let engine = Engine::with_storage(Config::default(), factory).unwrap();
        let metadata = engine.metadata().unwrap();
        assert_eq!(
            metadata.db_mapping(0).unwrap(),
            Bytes::from_static(b"memory-0")
        );
        assert_eq!(
            metadata.db_mapping(15).unwrap(),
            Bytes::from_static(b"memory-15")
        );
    }

    #[test]
    fn metadata_replication_state_round_trips() {
        let factory = Arc::new(MemStorageFactory::new());
        let engine = Engine::with_storage(Config::default(), factory).unwrap();
        let metadata = engine.metadata().unwrap();
        metadata.set_repl_id(b"replid-0123456789abcdef");
        metadata.set_repl_offset(12345);
        metadata.set_repl_stream_db(3);

        assert_eq!(
            metadata.repl_id().unwrap(),
            Bytes::from_static(b"replid-0123456789abcdef")
        );
        assert_eq!(metadata.repl_offset(), Some(12345));
        assert_eq!(metadata.repl_stream_db(), Some(3));
    }

    #[test]
    fn tick_runs_clean() {
        let mut engine = Engine::new(Config::default());
        engine
            .db_mut(0)
            .insert(Bytes::from_static(b"k"), ObjRef::string("v"), false, false)
            .unwrap();
        engine.tick();
        assert!(engine.db_mut(0).get(b"k").is_some());
    }
}
