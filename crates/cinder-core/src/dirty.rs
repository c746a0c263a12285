//! The dirty set: keys written since the last flush window.
//!
//! Consumed by the storage layer to replay writes into the provider.
//! A bulk operation (FLUSHALL-scale rewrites, full loads) sets the
//! `all_changed` bit instead of enumerating keys, and the flush path
//! then re-serialises the whole database.

use ahash::AHashSet;
use bytes::Bytes;

/// Keys mutated since the last processing window.
#[derive(Debug, Default)]
pub struct DirtySet {
    keys: AHashSet<Bytes>,
    all_changed: bool,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sizes the key set for an expected burst of writes.
    pub fn reserve(&mut self, additional: usize) {
        self.keys.reserve(additional);
    }

    /// Records a single mutated key. No-op once `all_changed` is set —
    /// the whole database is getting rewritten anyway.
    pub fn record(&mut self, key: Bytes) {
        if !self.all_changed {
            self.keys.insert(key);
        }
    }

    /// Marks the entire database as changed and drops the per-key set.
    pub fn mark_all_changed(&mut self) {
        self.all_changed = true;
        self.keys.clear();
        self.keys.shrink_to_fit();
    }

    pub fn all_changed(&self) -> bool {
        self.all_changed
    }

    /// Whether `key` has a pending unflushed write.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.all_changed || self.keys.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        !self.all_changed && self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Drains the recorded state, resetting this set for the next
    /// window. Returns `(all_changed, keys)`.
    pub fn take(&mut self) -> (bool, AHashSet<Bytes>) {
        let all = std::mem::take(&mut self.all_changed);
        let keys = std::mem::take(&mut self.keys);
        (all, keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_take() {
        let mut d = DirtySet::new();
        assert!(d.is_empty());
        d.record(Bytes::from_static(b"a"));
        d.record(Bytes::from_static(b"b"));
        d.record(Bytes::from_static(b"a"));
        assert_eq!(d.len(), 2);

        let (all, keys) = d.take();
        assert!(!all);
        assert_eq!(keys.len(), 2);
        assert!(d.is_empty());
    }

    #[test]
    fn all_changed_swallows_keys() {
        let mut d = DirtySet::new();
        d.record(Bytes::from_static(b"a"));
        d.mark_all_changed();
        d.record(Bytes::from_static(b"b"));
        assert!(!d.is_empty());
        assert_eq!(d.len(), 0);

        let (all, keys) = d.take();
        assert!(all);
        assert!(keys.is_empty());
        assert!(d.is_empty());
    }
}
