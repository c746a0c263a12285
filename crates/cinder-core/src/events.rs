//! Keyspace events published to external collaborators.
//!
//! Notification subscribers, replication, and stats all observe the
//! keyspace through this one fan-out point. Events are emitted after
//! the mutation is visible, on the mutating thread.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::value::ObjRef;

/// Why a key left the keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// Explicit DEL/UNLINK-class removal.
    User,
    /// The key's TTL fired.
    Expired,
    /// Removed under memory pressure.
    Evicted,
    /// The whole database was flushed.
    Flushed,
}

/// One observable keyspace transition.
#[derive(Debug, Clone)]
pub enum Event {
    KeyInserted {
        db: usize,
        key: Bytes,
        value: ObjRef,
        expire_ms: Option<u64>,
    },
    KeyDeleted {
        db: usize,
        key: Bytes,
        reason: DeleteReason,
    },
    SubkeyExpired {
        db: usize,
        key: Bytes,
        subkey: Bytes,
        when_ms: u64,
    },
    StorageReadHit {
        db: usize,
    },
    StorageReadMiss {
        db: usize,
    },
    SnapshotCreated {
        db: usize,
        depth: u32,
    },
    SnapshotEnded {
        db: usize,
    },
}

type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

/// Cloneable fan-out handle. Subscribing is rare; emitting is the hot
/// path, so subscribers sit behind a read-mostly lock.
#[derive(Clone, Default)]
pub struct EventSink {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback invoked for every subsequent event.
    pub fn subscribe(&self, f: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribers.write().push(Box::new(f));
    }

    /// Delivers an event to every subscriber.
    pub fn emit(&self, event: Event) {
        let subs = self.subscribers.read();
        for sub in subs.iter() {
            sub(&event);
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}
