//! Eviction under memory pressure: policies, the candidate pool, and
//! the LRU/LFU clocks.
//!
//! Eviction is sampling-based: each cycle draws a handful of random
//! keys, merges them into a small pool ordered by how evictable they
//! look, and removes from the best end until accounting is back under
//! the cap. This trades perfect LRU/LFU accuracy for O(1) eviction
//! with no auxiliary ordering structure on the write path.

use bytes::Bytes;

use crate::db::Database;
use crate::error::EngineError;
use crate::events::DeleteReason;
use crate::memory::effective_limit;
use crate::value::Object;

/// How the keyspace responds when the memory limit is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Reject memory-consuming writes when full.
    #[default]
    NoEviction,
    /// Approximate LRU over all keys.
    AllKeysLru,
    /// Approximate LFU over all keys.
    AllKeysLfu,
    /// Uniform random over all keys.
    AllKeysRandom,
    /// Approximate LRU over keys with an expiration.
    VolatileLru,
    /// Approximate LFU over keys with an expiration.
    VolatileLfu,
    /// Uniform random over keys with an expiration.
    VolatileRandom,
    /// Soonest-expiring first, over keys with an expiration.
    VolatileTtl,
}

impl EvictionPolicy {
    pub fn uses_lru(self) -> bool {
        matches!(self, EvictionPolicy::AllKeysLru | EvictionPolicy::VolatileLru)
    }

    pub fn uses_lfu(self) -> bool {
        matches!(self, EvictionPolicy::AllKeysLfu | EvictionPolicy::VolatileLfu)
    }

    pub fn is_random(self) -> bool {
        matches!(
            self,
            EvictionPolicy::AllKeysRandom | EvictionPolicy::VolatileRandom
        )
    }

    /// Volatile policies only consider keys carrying an expiration.
    pub fn volatile_only(self) -> bool {
        matches!(
            self,
            EvictionPolicy::VolatileLru
                | EvictionPolicy::VolatileLfu
                | EvictionPolicy::VolatileRandom
                | EvictionPolicy::VolatileTtl
        )
    }

    /// Shared integer singletons carry no per-value access history, so
    /// the idle-tracking policies refuse them.
    pub fn allows_shared_integers(self) -> bool {
        !self.uses_lru() && !self.uses_lfu()
    }
}

// ---------------------------------------------------------------------------
// LRU clock
// ---------------------------------------------------------------------------

/// Bits of the wrapping LRU clock stored in each value.
pub const LRU_BITS: u32 = 24;

/// Maximum clock reading before wrap.
pub const LRU_CLOCK_MAX: u32 = (1 << LRU_BITS) - 1;

/// Clock resolution in milliseconds. At millisecond resolution the
/// 24-bit clock wraps every ~4.6 hours; idle computation handles the
/// wrap.
pub const LRU_CLOCK_RESOLUTION_MS: u64 = 1;

/// Current LRU clock reading for a given wall time.
#[inline]
pub fn lru_clock(now_ms: u64) -> u32 {
    ((now_ms / LRU_CLOCK_RESOLUTION_MS) as u32) & LRU_CLOCK_MAX
}

/// Milliseconds since the value was last touched, handling clock wrap.
pub fn lru_idle_ms(clock: u32, value_lru: u32) -> u64 {
    let ticks = if clock >= value_lru {
        (clock - value_lru) as u64
    } else {
        (clock + (LRU_CLOCK_MAX - value_lru)) as u64
    };
    ticks * LRU_CLOCK_RESOLUTION_MS
}

// ---------------------------------------------------------------------------
// LFU counter
// ---------------------------------------------------------------------------

/// Initial LFU counter for a fresh value; nonzero so brand-new keys
/// aren't immediately the best eviction candidates.
pub const LFU_INIT_VAL: u8 = 5;

fn lfu_minutes(now_ms: u64) -> u16 {
    ((now_ms / 60_000) & 0xFFFF) as u16
}

/// Logarithmic counter increment: the probability of bumping shrinks as
/// the counter grows, scaled by `log_factor`, saturating at 255.
pub fn lfu_increment(counter: u8, log_factor: u8) -> u8 {
    if counter == 255 {
        return 255;
    }
    let r: f64 = rand::random();
    let base = (counter.saturating_sub(LFU_INIT_VAL)) as f64;
    let p = 1.0 / (base * log_factor as f64 + 1.0);
    if r < p {
        counter + 1
    } else {
        counter
    }
}

/// Applies the time-based decay to an LFU word before reading it.
///
/// The counter halves — or drops by one for small counts — once per
/// `decay_minutes` elapsed since the last access.
pub fn lfu_decayed_counter(word: u32, now_ms: u64, decay_minutes: u64) -> u8 {
    let last_minutes = (word >> 8) as u16;
    let counter = (word & 0xFF) as u8;
    if decay_minutes == 0 {
        return counter;
    }
    let now_min = lfu_minutes(now_ms);
    let elapsed = now_min.wrapping_sub(last_minutes) as u64;
    let periods = elapsed / decay_minutes;
    if periods == 0 {
        return counter;
    }
    if counter > LFU_INIT_VAL * 2 {
        (counter as u64 >> periods.min(7)) as u8
    } else {
        counter.saturating_sub(periods.min(255) as u8)
    }
}

/// Records an access on a value under the active policy.
pub fn touch(obj: &Object, policy: EvictionPolicy, now_ms: u64, log_factor: u8, decay_minutes: u64) {
    if policy.uses_lfu() {
        let counter = lfu_decayed_counter(obj.lru_word(), now_ms, decay_minutes);
        let bumped = lfu_increment(counter, log_factor);
        obj.set_lru_word(((lfu_minutes(now_ms) as u32) << 8) | bumped as u32);
    } else {
        obj.set_lru_word(lru_clock(now_ms));
    }
}

/// Initialises a fresh value's clock word under the active policy.
pub fn init_clock_word(obj: &Object, policy: EvictionPolicy, now_ms: u64) {
    if policy.uses_lfu() {
        obj.set_lru_word(((lfu_minutes(now_ms) as u32) << 8) | LFU_INIT_VAL as u32);
    } else {
        obj.set_lru_word(lru_clock(now_ms));
    }
}

/// Policy-specific eviction score: higher is a better candidate.
fn eviction_score(
    db: &Database,
    key: &Bytes,
    obj: &Object,
    policy: EvictionPolicy,
    now_ms: u64,
    decay_minutes: u64,
) -> u64 {
    if policy.uses_lru() {
        lru_idle_ms(lru_clock(now_ms), obj.lru_word())
    } else if policy.uses_lfu() {
        255 - lfu_decayed_counter(obj.lru_word(), now_ms, decay_minutes) as u64
    } else {
        // VolatileTtl: sooner expiry scores higher
        match db.expire_time(key) {
            Some(when) => u64::MAX - when,
            None => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// eviction pool
// ---------------------------------------------------------------------------

/// Pool capacity. Candidates survive across cycles so repeated sampling
/// converges toward the genuinely idle keys.
pub const EVICTION_POOL_SIZE: usize = 16;

#[derive(Debug, Clone)]
struct PoolEntry {
    key: Bytes,
    score: u64,
}

/// Fixed-capacity candidate pool ordered by ascending score; eviction
/// takes from the tail (the best candidate seen so far).
#[derive(Debug, Default)]
pub struct EvictionPool {
    entries: Vec<PoolEntry>,
}

impl EvictionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offers a candidate. Kept when the pool has room or the score
    /// beats the current minimum.
    fn offer(&mut self, key: Bytes, score: u64) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.key == key) {
            existing.score = score;
            self.entries.sort_by_key(|e| e.score);
            return;
        }
        let at = self.entries.partition_point(|e| e.score < score);
        if self.entries.len() < EVICTION_POOL_SIZE {
            self.entries.insert(at, PoolEntry { key, score });
        } else if at > 0 {
            // better than the worst entry: displace it
            self.entries.remove(0);
            let at = self.entries.partition_point(|e| e.score < score);
            self.entries.insert(at, PoolEntry { key, score });
        }
    }

    /// Takes the best candidate.
    fn pop_best(&mut self) -> Option<Bytes> {
        self.entries.pop().map(|e| e.key)
    }

    /// Drops a candidate that turned out to be gone already.
    fn forget(&mut self, key: &Bytes) {
        self.entries.retain(|e| e.key != *key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Upper bound of evictions per invocation, so one oversized write
/// can't stall its caller on an unbounded sweep.
const MAX_EVICTIONS_PER_CALL: usize = 32;

/// Frees memory until accounting is under the cap or the step budget
/// runs out.
///
/// With a storage provider attached, clean resident values are spilled
/// (dropped from memory, retained in storage); otherwise keys are
/// deleted outright with an `Evicted` event. Returns the number of
/// evictions performed, or `OutOfMemory` when the policy forbids
/// eviction or nothing evictable remains.
pub fn perform_evictions(db: &mut Database, now_ms: u64) -> Result<usize, EngineError> {
    let Some(max_memory) = db.config().max_memory else {
        return Ok(0);
    };
    let limit = effective_limit(max_memory);
    let mut evicted = 0usize;

    while db.used_bytes() > limit {
        if evicted >= MAX_EVICTIONS_PER_CALL {
            break;
        }
        if !evict_one(db, now_ms)? {
            return Err(EngineError::OutOfMemory);
        }
        evicted += 1;
    }
    Ok(evicted)
}

/// One eviction round: sample, merge into the pool, remove the best
/// candidate. `Ok(false)` means nothing evictable was found;
/// `OutOfMemory` means the policy forbids eviction outright.
pub(crate) fn evict_one(db: &mut Database, now_ms: u64) -> Result<bool, EngineError> {
    let policy = db.config().eviction_policy;
    if policy == EvictionPolicy::NoEviction {
        return Err(EngineError::OutOfMemory);
    }
    let samples = db.config().maxmemory_samples;
    let decay = db.config().lfu_decay_time_min;

    // a victim from the pool may have been deleted since it was
    // sampled; retry a few times before giving up
    for _ in 0..4 {
        let victim = if policy.is_random() {
            db.sample_keys(policy.volatile_only(), 1).pop()
        } else {
            // refill the pool from a fresh sample, then take the best
            for key in db.sample_keys(policy.volatile_only(), samples) {
                if let Some(obj) = db.peek(&key) {
                    let score = eviction_score(db, &key, obj.object(), policy, now_ms, decay);
                    db.eviction_pool_mut().offer(key, score);
                }
            }
            db.eviction_pool_mut().pop_best()
        };

        let Some(victim) = victim else {
            return Ok(false);
        };

        let freed = if db.has_storage() {
            db.spill_or_evict(&victim)
        } else {
            db.evict_key(&victim, DeleteReason::Evicted)
        };
        if freed {
            return Ok(true);
        }
        db.eviction_pool_mut().forget(&victim);
    }
    Ok(false)
}

/// Shrinks the storage footprint by deleting provider-chosen candidates
/// until `count` keys are gone or the provider runs out of suggestions.
pub fn evict_storage_candidates(db: &mut Database, count: usize) -> usize {
    let candidates = match db.storage_eviction_candidates(count) {
        Some(c) => c,
        None => return 0,
    };
    let mut removed = 0;
    for key in candidates {
        if db.evict_key(&key, DeleteReason::Evicted) {
            removed += 1;
        }
    }
    removed
}
