//! The expiration index: per-key and per-subkey TTLs ordered by time.
//!
//! Two views over the same entries: a per-key map for O(1) upsert,
//! removal, and borrowed-slice lookup, and a `BTreeMap` ordered by
//! absolute expire time so `earliest` is O(log n). Random sampling
//! draws from the per-key map, which is uniform enough for the
//! active-expire cycle.

use std::collections::BTreeMap;

use ahash::AHashMap;
use bytes::Bytes;
use rand::seq::IteratorRandom;

/// One TTL record. `subkey: None` means the whole key expires;
/// otherwise only the named subkey does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireEntry {
    pub key: Bytes,
    pub subkey: Option<Bytes>,
    pub when_ms: u64,
}

#[derive(Debug, Clone, Default)]
struct KeyExpires {
    whole: Option<u64>,
    subs: AHashMap<Bytes, u64>,
}

impl KeyExpires {
    fn is_empty(&self) -> bool {
        self.whole.is_none() && self.subs.is_empty()
    }

    fn count(&self) -> usize {
        usize::from(self.whole.is_some()) + self.subs.len()
    }
}

/// Ordered-by-time index of every TTL in one database.
#[derive(Debug, Clone, Default)]
pub struct ExpireIndex {
    by_key: AHashMap<Bytes, KeyExpires>,
    by_when: BTreeMap<(u64, Bytes, Option<Bytes>), ()>,
    entries: usize,
}

impl ExpireIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a TTL for `(key, subkey)`. Returns the previous expire
    /// time when one was replaced.
    pub fn set(&mut self, key: Bytes, subkey: Option<Bytes>, when_ms: u64) -> Option<u64> {
        let slot = self.by_key.entry(key.clone()).or_default();
        let prev = match &subkey {
            None => slot.whole.replace(when_ms),
            Some(sub) => slot.subs.insert(sub.clone(), when_ms),
        };
        match prev {
            Some(old_when) => {
                self.by_when.remove(&(old_when, key.clone(), subkey.clone()));
            }
            None => self.entries += 1,
        }
        self.by_when.insert((when_ms, key, subkey), ());
        prev
    }

    /// Removes the TTL for `(key, subkey)`. Returns whether an entry
    /// existed.
    pub fn remove(&mut self, key: &[u8], subkey: Option<&[u8]>) -> bool {
        let Some((owned_key, slot)) = self.by_key.get_key_value(key) else {
            return false;
        };
        let owned_key = owned_key.clone();
        let removed_when = match subkey {
            None => slot.whole,
            Some(sub) => slot.subs.get(sub).copied(),
        };
        let Some(when) = removed_when else {
            return false;
        };

        let owned_sub = subkey.map(Bytes::copy_from_slice);
        self.by_when.remove(&(when, owned_key.clone(), owned_sub));

        let slot = self.by_key.get_mut(key).expect("checked above");
        match subkey {
            None => slot.whole = None,
            Some(sub) => {
                slot.subs.remove(sub);
            }
        }
        if slot.is_empty() {
            self.by_key.remove(key);
        }
        self.entries -= 1;
        true
    }

    /// Removes every entry for `key`, whole-key and subkey alike.
    /// Returns how many were dropped. Used when the key is deleted.
    pub fn remove_all_for_key(&mut self, key: &[u8]) -> usize {
        let Some((owned_key, slot)) = self.by_key.remove_entry(key) else {
            return 0;
        };
        if let Some(when) = slot.whole {
            self.by_when.remove(&(when, owned_key.clone(), None));
        }
        for (sub, when) in &slot.subs {
            self.by_when
                .remove(&(*when, owned_key.clone(), Some(sub.clone())));
        }
        let removed = slot.count();
        self.entries -= removed;
        removed
    }

    /// Looks up the expire time for `(key, subkey)`.
    pub fn get(&self, key: &[u8], subkey: Option<&[u8]>) -> Option<u64> {
        let slot = self.by_key.get(key)?;
        match subkey {
            None => slot.whole,
            Some(sub) => slot.subs.get(sub).copied(),
        }
    }

    /// Whether `key` has a whole-key expiration.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key, None).is_some()
    }

    /// Whether any entry (whole-key or subkey) exists for `key`.
    pub fn any_for_key(&self, key: &[u8]) -> bool {
        self.by_key.contains_key(key)
    }

    /// Up to `n` entries at uniform-ish random positions.
    pub fn random_sample(&self, n: usize) -> Vec<ExpireEntry> {
        let mut rng = rand::rng();
        self.iter().choose_multiple(&mut rng, n)
    }

    /// The entry with the soonest expire time.
    pub fn earliest(&self) -> Option<ExpireEntry> {
        self.by_when
            .keys()
            .next()
            .map(|(when, key, subkey)| ExpireEntry {
                key: key.clone(),
                subkey: subkey.clone(),
                when_ms: *when,
            })
    }

    /// Iterates every entry in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = ExpireEntry> + '_ {
        self.by_key.iter().flat_map(|(key, slot)| {
            let whole = slot.whole.map(|when| ExpireEntry {
                key: key.clone(),
                subkey: None,
                when_ms: when,
            });
            let subs = slot.subs.iter().map(|(sub, when)| ExpireEntry {
                key: key.clone(),
                subkey: Some(sub.clone()),
                when_ms: *when,
            });
            whole.into_iter().chain(subs)
        })
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
        self.by_when.clear();
        self.entries = 0;
    }
}
