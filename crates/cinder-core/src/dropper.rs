//! Background reclamation for expensive drops.
//!
//! Destructor work for large values, whole tables, and retired
//! snapshot levels is offloaded to a dedicated OS thread so the write
//! path stays responsive. A plain `std::thread` rather than any async
//! machinery: dropping data structures is CPU-bound work.
//!
//! Senders never block — when the channel is full or the thread is
//! gone, the item is simply dropped inline.

use std::sync::mpsc::{self, SyncSender, TrySendError};

use bytes::Bytes;

use crate::memory::is_large_value;
use crate::table::RawTable;
use crate::value::ObjRef;

/// Bounded channel capacity. Large enough to absorb bursts without
/// meaningful memory overhead.
const DROP_CHANNEL_CAPACITY: usize = 4096;

/// Items sent to the reclamation thread. The fields are never read —
/// the whole point is that the thread receives them and lets their
/// destructors run.
#[allow(dead_code)]
enum Reclaim {
    /// A single value removed from the keyspace.
    Value(ObjRef),
    /// A whole primary table, e.g. from an async database clear.
    Table(RawTable<ObjRef>),
    /// A tombstone table retired with its snapshot level.
    Tombstones(RawTable<()>),
    /// Arbitrary boxed state (retired snapshot levels).
    Other(Box<dyn Send>),
    /// Keys collected during a sweep.
    Keys(Vec<Bytes>),
}

/// A cloneable handle for deferring expensive drops.
///
/// When every handle is gone the channel closes and the thread exits.
#[derive(Debug, Clone)]
pub struct DropHandle {
    tx: SyncSender<Reclaim>,
}

impl DropHandle {
    /// Spawns the reclamation thread and returns a handle.
    ///
    /// If the thread fails to spawn, a warning is logged and the handle
    /// degrades to dropping everything inline (the channel disconnects
    /// immediately, and `try_send` falls through).
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::sync_channel::<Reclaim>(DROP_CHANNEL_CAPACITY);

        if let Err(e) = std::thread::Builder::new()
            .name("cinder-drop".into())
            .spawn(move || {
                // draining the channel is the work: each received item
                // runs its destructor here
                while rx.recv().is_ok() {}
            })
        {
            tracing::warn!("failed to spawn drop thread, large values will be freed inline: {e}");
        }

        Self { tx }
    }

    /// Defers a value drop when it's large enough to be worth the
    /// channel overhead; small values drop inline immediately.
    pub fn defer_value(&self, value: ObjRef) {
        if !is_large_value(&value) {
            return;
        }
        self.send(Reclaim::Value(value));
    }

    /// Defers a value drop unconditionally (UNLINK-class removals).
    pub fn defer_value_always(&self, value: ObjRef) {
        self.send(Reclaim::Value(value));
    }

    /// Defers dropping an entire primary table (async clear).
    pub fn defer_table(&self, table: RawTable<ObjRef>) {
        if table.is_empty() {
            return;
        }
        self.send(Reclaim::Table(table));
    }

    /// Defers dropping a retired tombstone table.
    pub fn defer_tombstones(&self, table: RawTable<()>) {
        if table.is_empty() {
            return;
        }
        self.send(Reclaim::Tombstones(table));
    }

    /// Defers dropping arbitrary owned state.
    pub fn defer_boxed(&self, item: Box<dyn Send>) {
        self.send(Reclaim::Other(item));
    }

    fn send(&self, item: Reclaim) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                // channel full — drop inline rather than block the shard
                drop(item);
            }
            Err(TrySendError::Disconnected(item)) => {
                drop(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Payload;
    use std::collections::VecDeque;

    #[test]
    fn small_value_drops_inline() {
        let handle = DropHandle::spawn();
        handle.defer_value(ObjRef::string("tiny"));
    }

    #[test]
    fn large_list_is_deferred() {
        let handle = DropHandle::spawn();
        let mut list = VecDeque::new();
        for i in 0..100 {
            list.push_back(Bytes::from(format!("item-{i}")));
        }
        handle.defer_value(ObjRef::new(Payload::List(list)));
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    #[test]
    fn table_defer_skips_empty() {
        let handle = DropHandle::spawn();
        handle.defer_table(RawTable::new());
    }

    #[test]
    fn populated_table_is_deferred() {
        let handle = DropHandle::spawn();
        let mut table = RawTable::new();
        for i in 0..10 {
            table.insert(
                Bytes::from(format!("key-{i}")),
                ObjRef::string(format!("val-{i}")),
                true,
            );
        }
        handle.defer_table(table);
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}
