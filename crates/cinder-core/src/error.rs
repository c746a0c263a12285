//! Error types for the core engine.

use thiserror::Error;

use cinder_storage::StorageError;

/// Errors surfaced by keyspace operations.
///
/// These bubble to the client as typed replies; none of them abort the
/// process. Internal invariant violations (a key present in both the
/// primary and tombstone tables, mutation of a shared value) panic
/// instead — they indicate engine bugs, not user mistakes.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The operation was attempted on a key holding a value of the
    /// wrong type, e.g. a list push against a string.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// A memory-consuming write was rejected because eviction could not
    /// free enough space.
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,

    /// Numeric parse failure, syntax error, or out-of-range argument.
    #[error("ERR {0}")]
    InvalidArgument(String),

    /// A queued command failed validation, poisoning the MULTI block.
    #[error("EXECABORT Transaction discarded because of previous errors")]
    TransactionAborted,

    /// The key does not exist.
    #[error("ERR no such key")]
    KeyNotFound,

    /// The key is the target of an in-flight operation.
    #[error("BUSYKEY Target key name already exists")]
    KeyBusy,

    /// An optional snapshot request was declined (depth budget spent).
    #[error("snapshot unavailable")]
    SnapshotUnavailable,

    /// The storage version guard failed on open.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The dataset is still being restored; retry once loading ends.
    #[error("LOADING Server is loading the dataset in memory")]
    Loading,

    /// A write reached a read-only replica.
    #[error("READONLY You can't write against a read only replica")]
    ReadOnly,
}
