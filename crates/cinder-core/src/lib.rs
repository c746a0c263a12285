//! cinder-core: the keyspace engine.
//!
//! A Redis-protocol-compatible in-memory database core: multiple
//! logical databases of typed, reference-counted values with MVCC
//! snapshot isolation, incremental rehashing, lazy and active
//! expiration, sampling-based eviction, and an optional persistent
//! storage provider underneath (write-through or write-back).
//!
//! The wire protocol, command dispatch, replication transport, and
//! file formats live above and below this crate; what's here is the
//! per-database persistent-data layer and the machinery around it.

pub mod config;
pub mod db;
pub mod dirty;
pub mod driver;
pub mod dropper;
pub mod engine;
pub mod error;
pub mod events;
pub mod evict;
pub mod expire;
pub mod expire_cycle;
pub mod memory;
pub mod mvcc;
pub mod serial;
pub mod snapshot;
pub mod table;
pub mod time;
pub mod value;

pub use config::{parse_byte_size, parse_eviction_policy, parse_memory_model, Config, DbConfig, MemoryModel};
pub use db::{Database, DbStats};
pub use driver::Driver;
pub use dropper::DropHandle;
pub use engine::Engine;
pub use error::EngineError;
pub use events::{DeleteReason, Event, EventSink};
pub use evict::{perform_evictions, EvictionPolicy, EvictionPool};
pub use expire::{ExpireEntry, ExpireIndex};
pub use expire_cycle::{run_expire_cycle, CycleMode};
pub use mvcc::MvccClock;
pub use snapshot::{SnapshotId, SnapshotReader};
pub use table::RawTable;
pub use value::{ObjRef, Object, Payload, TypeTag};
