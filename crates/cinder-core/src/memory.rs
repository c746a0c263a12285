//! Memory accounting for the keyspace.
//!
//! Byte-level estimates updated on every mutation, so eviction triggers
//! and stats never need to scan the keyspace. Overhead constants are
//! empirical for 64-bit platforms; overestimating only makes eviction
//! fire a little early.

use crate::value::{ObjRef, Payload};

/// Percentage of the configured `maxmemory` used as the effective write
/// limit. The headroom absorbs allocator overhead, fragmentation, and
/// estimation error so the process isn't OOM-killed before eviction can
/// react.
pub const MEMORY_SAFETY_MARGIN_PERCENT: usize = 90;

/// Computes the effective memory limit after applying the safety margin.
pub fn effective_limit(max_bytes: usize) -> usize {
    ((max_bytes as u128) * (MEMORY_SAFETY_MARGIN_PERCENT as u128) / 100) as usize
}

/// Estimated fixed overhead per keyspace entry: the key's `Bytes`
/// handle, the object header (payload tag + bookkeeping words + Arc
/// counts), and hash-table bucket slack.
pub(crate) const ENTRY_OVERHEAD: usize = 128;

/// Per-element overhead inside a `VecDeque` of `Bytes`.
pub(crate) const DEQUE_ELEMENT_OVERHEAD: usize = 32;

/// Per-entry overhead inside a hash payload.
pub(crate) const HASH_ENTRY_OVERHEAD: usize = 64;

/// Per-member overhead inside a set payload.
pub(crate) const SET_MEMBER_OVERHEAD: usize = 40;

/// Per-member overhead inside a sorted-set payload (score + member).
pub(crate) const ZSET_MEMBER_OVERHEAD: usize = 48;

/// Tracks estimated usage for a single database.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    used_bytes: usize,
    key_count: usize,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets tracking to zero. Used when a database is cleared.
    pub fn reset(&mut self) {
        self.used_bytes = 0;
        self.key_count = 0;
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn key_count(&self) -> usize {
        self.key_count
    }

    /// Records the addition of a new entry.
    pub fn add(&mut self, key: &[u8], value: &ObjRef) {
        self.used_bytes += entry_size(key, value);
        self.key_count += 1;
    }

    /// Records the removal of an entry.
    pub fn remove(&mut self, key: &[u8], value: &ObjRef) {
        let size = entry_size(key, value);
        self.used_bytes = self.used_bytes.saturating_sub(size);
        self.key_count = self.key_count.saturating_sub(1);
    }

    /// Adjusts for an overwrite: key count unchanged.
    pub fn replace(&mut self, key: &[u8], old: &ObjRef, new: &ObjRef) {
        let old_size = entry_size(key, old);
        let new_size = entry_size(key, new);
        self.used_bytes = self
            .used_bytes
            .saturating_sub(old_size)
            .saturating_add(new_size);
    }
}

/// Estimated total footprint of one entry.
pub fn entry_size(key: &[u8], value: &ObjRef) -> usize {
    key.len() + value_size(value) + ENTRY_OVERHEAD
}

/// Estimated payload footprint. Shared singletons cost nothing extra —
/// they exist regardless of how many keys reference them.
pub fn value_size(value: &ObjRef) -> usize {
    if value.is_shared() {
        return 0;
    }
    payload_size(value.object().payload())
}

fn payload_size(payload: &Payload) -> usize {
    match payload {
        Payload::Int(_) => 0,
        Payload::Str(b) => b.len(),
        Payload::List(d) => d
            .iter()
            .map(|b| b.len() + DEQUE_ELEMENT_OVERHEAD)
            .sum(),
        Payload::Set(s) => s.iter().map(|m| m.len() + SET_MEMBER_OVERHEAD).sum(),
        Payload::SortedSet(ss) => ss
            .iter()
            .map(|(_, m)| m.len() + ZSET_MEMBER_OVERHEAD)
            .sum(),
        Payload::Hash(h) => h
            .iter()
            .map(|(k, v)| k.len() + v.len() + HASH_ENTRY_OVERHEAD)
            .sum(),
        Payload::Stream(s) => s
            .entries
            .iter()
            .map(|e| {
                16 + e
                    .fields
                    .iter()
                    .map(|(k, v)| k.len() + v.len() + HASH_ENTRY_OVERHEAD)
                    .sum::<usize>()
            })
            .sum(),
        Payload::Module(m) => m.type_name.len() + m.data.len() + 48,
    }
}

/// Element count threshold above which dropping a collection is worth
/// deferring to the background reclamation thread.
pub const LAZY_FREE_THRESHOLD: usize = 64;

/// Returns `true` if dropping this value is expensive enough to justify
/// the reclamation channel overhead. Strings are always cheap
/// (reference-counted `Bytes`).
pub fn is_large_value(value: &ObjRef) -> bool {
    match value.object().payload() {
        Payload::Int(_) | Payload::Str(_) | Payload::Module(_) => false,
        Payload::List(d) => d.len() > LAZY_FREE_THRESHOLD,
        Payload::Set(s) => s.len() > LAZY_FREE_THRESHOLD,
        Payload::SortedSet(ss) => ss.len() > LAZY_FREE_THRESHOLD,
        Payload::Hash(h) => h.len() > LAZY_FREE_THRESHOLD,
        Payload::Stream(s) => s.entries.len() > LAZY_FREE_THRESHOLD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn string_val(s: &str) -> ObjRef {
        ObjRef::string(s.to_string())
    }

    #[test]
    fn new_tracker_is_empty() {
        let t = MemoryTracker::new();
        assert_eq!(t.used_bytes(), 0);
        assert_eq!(t.key_count(), 0);
    }

    #[test]
    fn add_then_remove_balances() {
        let mut t = MemoryTracker::new();
        let val = string_val("data");
        t.add(b"k", &val);
        assert_eq!(t.key_count(), 1);
        assert_eq!(t.used_bytes(), entry_size(b"k", &val));

        t.remove(b"k", &val);
        assert_eq!(t.used_bytes(), 0);
        assert_eq!(t.key_count(), 0);
    }

    #[test]
    fn replace_adjusts_usage() {
        let mut t = MemoryTracker::new();
        let old = string_val("short");
        let new = string_val("a much longer value here");
        t.add(b"k", &old);

        let before = t.used_bytes();
        t.replace(b"k", &old, &new);

        assert_eq!(t.key_count(), 1);
        assert!(t.used_bytes() > before);
        assert_eq!(t.used_bytes(), entry_size(b"k", &new));
    }

    #[test]
    fn remove_saturates_at_zero() {
        let mut t = MemoryTracker::new();
        let val = string_val("x");
        t.remove(b"k", &val);
        assert_eq!(t.used_bytes(), 0);
        assert_eq!(t.key_count(), 0);
    }

    #[test]
    fn shared_values_cost_nothing() {
        let shared = crate::value::shared_integer(7).unwrap();
        assert_eq!(value_size(&shared), 0);
    }

    #[test]
    fn effective_limit_applies_margin() {
        assert_eq!(effective_limit(1000), 900);
        assert_eq!(effective_limit(0), 0);
    }

    #[test]
    fn string_is_never_large() {
        let val = ObjRef::new(Payload::Str(Bytes::from(vec![0u8; 10_000])));
        assert!(!is_large_value(&val));
    }

    #[test]
    fn big_list_is_large() {
        let mut d = std::collections::VecDeque::new();
        for _ in 0..=LAZY_FREE_THRESHOLD {
            d.push_back(Bytes::from_static(b"x"));
        }
        assert!(is_large_value(&ObjRef::new(Payload::List(d))));
    }

    #[test]
    fn small_list_is_not_large() {
        let mut d = std::collections::VecDeque::new();
        for _ in 0..LAZY_FREE_THRESHOLD {
            d.push_back(Bytes::from_static(b"x"));
        }
        assert!(!is_large_value(&ObjRef::new(Payload::List(d))));
    }
}
