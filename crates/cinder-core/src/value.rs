//! Stored values: typed payloads behind shared-or-counted references.
//!
//! A [`Payload`] is the typed data itself. An [`Object`] wraps it with
//! the per-value bookkeeping the engine needs: the LRU/LFU word, the
//! MVCC stamp, and the expiration-participation bit. An [`ObjRef`] is
//! how the rest of the engine holds objects — either a `Counted`
//! reference-counted heap allocation, or a `Shared` process-lifetime
//! singleton (small integers) that is never mutated and never freed.
//!
//! Mutation goes through a single chokepoint, [`ObjRef::payload_mut`],
//! which refuses shared objects and copies multiply-referenced ones.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;

use crate::mvcc::MVCC_INVALID;

/// Longest decimal representation of an i64 including the sign.
pub const MAX_INT_DIGITS: usize = 20;

/// Strings at or below this length report the embedded encoding; the
/// whole object fits a small-allocation size class.
pub const EMBED_LIMIT: usize = 44;

/// Integers in `[0, SHARED_INTEGER_CAP)` have process-lifetime shared
/// singletons.
pub const SHARED_INTEGER_CAP: i64 = 10_000;

/// Serialisation discriminant per value type. The wire codec writes
/// this as the leading byte of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    String = 0,
    List = 1,
    Set = 2,
    SortedSet = 3,
    Hash = 4,
    Stream = 5,
    Module = 6,
}

impl TypeTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => TypeTag::String,
            1 => TypeTag::List,
            2 => TypeTag::Set,
            3 => TypeTag::SortedSet,
            4 => TypeTag::Hash,
            5 => TypeTag::Stream,
            6 => TypeTag::Module,
            _ => return None,
        })
    }

    /// Type name matching the TYPE command's output.
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::String => "string",
            TypeTag::List => "list",
            TypeTag::Set => "set",
            TypeTag::SortedSet => "zset",
            TypeTag::Hash => "hash",
            TypeTag::Stream => "stream",
            TypeTag::Module => "module",
        }
    }
}

/// Physical representation of a string payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    Raw = 0,
    Embed = 1,
    Int = 2,
}

impl Encoding {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Encoding::Raw,
            1 => Encoding::Embed,
            2 => Encoding::Int,
            _ => return None,
        })
    }
}

/// Sorted set of unique members, each with a float score, ordered by
/// `(score, member)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedSet {
    entries: Vec<(f64, Bytes)>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a member or updates its score. Returns `true` when the
    /// member was new.
    pub fn insert(&mut self, score: f64, member: Bytes) -> bool {
        if let Some(pos) = self.entries.iter().position(|(_, m)| *m == member) {
            self.entries.remove(pos);
            let at = self.insertion_point(score, &member);
            self.entries.insert(at, (score, member));
            false
        } else {
            let at = self.insertion_point(score, &member);
            self.entries.insert(at, (score, member));
            true
        }
    }

    fn insertion_point(&self, score: f64, member: &Bytes) -> usize {
        self.entries
            .partition_point(|(s, m)| match s.total_cmp(&score) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => m < member,
                std::cmp::Ordering::Greater => false,
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &Bytes)> {
        self.entries.iter().map(|(s, m)| (*s, m))
    }
}

/// A stream entry id: millisecond time plus a sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

/// One stream entry: an id and its field-value pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<(Bytes, Bytes)>,
}

/// An append-only log of entries with monotonically increasing ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stream {
    pub entries: Vec<StreamEntry>,
    pub last_id: StreamId,
}

/// An opaque module-owned value: the registered type name plus the
/// module's serialised representation.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleValue {
    pub type_name: String,
    pub data: Bytes,
}

/// The typed data stored under a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Integer-encoded string.
    Int(i64),
    /// Raw or embedded binary-safe string.
    Str(Bytes),
    /// Ordered list of binary-safe elements.
    List(VecDeque<Bytes>),
    /// Unordered set of unique members.
    Set(AHashSet<Bytes>),
    /// Members ordered by score.
    SortedSet(SortedSet),
    /// Field-value map.
    Hash(AHashMap<Bytes, Bytes>),
    /// Append-only entry log.
    Stream(Stream),
    /// Module-owned opaque value.
    Module(ModuleValue),
}

impl Payload {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Payload::Int(_) | Payload::Str(_) => TypeTag::String,
            Payload::List(_) => TypeTag::List,
            Payload::Set(_) => TypeTag::Set,
            Payload::SortedSet(_) => TypeTag::SortedSet,
            Payload::Hash(_) => TypeTag::Hash,
            Payload::Stream(_) => TypeTag::Stream,
            Payload::Module(_) => TypeTag::Module,
        }
    }
}

/// A payload plus the per-value bookkeeping words.
///
/// The LRU word, MVCC stamp, and expire bit are atomics so read paths
/// can touch them through a shared reference.
pub struct Object {
    payload: Payload,
    /// LRU clock reading, or `(minutes << 8) | counter` under LFU.
    lru: AtomicU32,
    mvcc: AtomicU64,
    has_expire: AtomicBool,
}

impl Object {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            lru: AtomicU32::new(0),
            mvcc: AtomicU64::new(MVCC_INVALID),
            has_expire: AtomicBool::new(false),
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn type_tag(&self) -> TypeTag {
        self.payload.type_tag()
    }

    /// The physical encoding, derived from the payload shape.
    pub fn encoding(&self) -> Encoding {
        match &self.payload {
            Payload::Int(_) => Encoding::Int,
            Payload::Str(b) if b.len() <= EMBED_LIMIT => Encoding::Embed,
            _ => Encoding::Raw,
        }
    }

    #[inline]
    pub fn lru_word(&self) -> u32 {
        self.lru.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_lru_word(&self, word: u32) {
        self.lru.store(word, Ordering::Relaxed);
    }

    #[inline]
    pub fn mvcc(&self) -> u64 {
        self.mvcc.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_mvcc(&self, stamp: u64) {
        self.mvcc.store(stamp, Ordering::Relaxed);
    }

    #[inline]
    pub fn has_expire(&self) -> bool {
        self.has_expire.load(Ordering::Relaxed)
    }

    /// Length of the string as it would print: digit count for
    /// integer-encoded values (constant time), byte length otherwise.
    /// `None` for non-string payloads.
    pub fn stringified_length(&self) -> Option<usize> {
        match &self.payload {
            Payload::Int(n) => Some(int_digits(*n)),
            Payload::Str(b) => Some(b.len()),
            _ => None,
        }
    }

    fn deep_clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            lru: AtomicU32::new(self.lru_word()),
            mvcc: AtomicU64::new(self.mvcc()),
            has_expire: AtomicBool::new(self.has_expire()),
        }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("payload", &self.payload)
            .field("mvcc", &self.mvcc())
            .field("has_expire", &self.has_expire())
            .finish()
    }
}

/// How the engine holds an [`Object`].
///
/// Cloning a `Counted` ref bumps the count; dropping the last one frees
/// the object and runs the payload's type-specific destructor exactly
/// once. `Shared` refs point at process-lifetime singletons: cloning
/// and dropping them are free, and mutation is refused.
#[derive(Debug, Clone)]
pub enum ObjRef {
    Shared(&'static Object),
    Counted(Arc<Object>),
}

impl ObjRef {
    /// Wraps a payload in a fresh counted object.
    pub fn new(payload: Payload) -> Self {
        ObjRef::Counted(Arc::new(Object::new(payload)))
    }

    /// Convenience constructor for string values.
    pub fn string(data: impl Into<Bytes>) -> Self {
        Self::new(Payload::Str(data.into()))
    }

    pub fn object(&self) -> &Object {
        match self {
            ObjRef::Shared(o) => o,
            ObjRef::Counted(o) => o,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, ObjRef::Shared(_))
    }

    /// A counted deep copy, used where an owned object is required
    /// (e.g. attaching an expiration to a shared singleton).
    pub fn owned_copy(&self) -> ObjRef {
        ObjRef::Counted(Arc::new(self.object().deep_clone()))
    }

    /// The single mutation chokepoint.
    ///
    /// Panics on shared singletons — they are immutable by contract.
    /// When the object is referenced from more than one place (a
    /// snapshot, an in-flight reader), the payload is copied first so
    /// existing readers keep their view.
    pub fn payload_mut(&mut self) -> &mut Payload {
        assert!(!self.is_shared(), "attempted to mutate a shared value");
        let ObjRef::Counted(arc) = self else {
            unreachable!()
        };
        if Arc::get_mut(arc).is_none() {
            *arc = Arc::new(arc.deep_clone());
        }
        let obj = Arc::get_mut(arc).expect("exclusive after copy");
        &mut obj.payload
    }

    /// Flags the object as participating in the expiration index.
    ///
    /// Panics when asked to set the bit on a shared singleton; callers
    /// replace the binding with [`ObjRef::owned_copy`] first.
    pub fn set_has_expire(&self, has: bool) {
        if has {
            assert!(
                !self.is_shared(),
                "attempted to set the expire bit on a shared value"
            );
        }
        self.object().has_expire.store(has, Ordering::Relaxed);
    }

    /// Binary-safe comparison after resolving integer encoding.
    pub fn compare(a: &ObjRef, b: &ObjRef) -> std::cmp::Ordering {
        fn text(o: &Object) -> Bytes {
            match o.payload() {
                Payload::Int(n) => Bytes::from(n.to_string()),
                Payload::Str(b) => b.clone(),
                other => panic!("compare on non-string payload {other:?}"),
            }
        }
        text(a.object()).as_ref().cmp(text(b.object()).as_ref())
    }

    /// Re-encodes a string object into its cheapest representation.
    ///
    /// Multiply-referenced and shared objects pass through unchanged.
    /// A short decimal string becomes integer-encoded; when the policy
    /// permits shared integers, small values collapse onto the
    /// process-wide singletons. Non-strings pass through unchanged.
    /// (Raw byte strings already use exact-size allocations, so the
    /// embedded and slack-trim conversions have nothing left to do.)
    pub fn try_encode(self, allow_shared: bool) -> ObjRef {
        let ObjRef::Counted(arc) = self else {
            return self;
        };
        if Arc::strong_count(&arc) > 1 {
            return ObjRef::Counted(arc);
        }
        let parsed = match arc.payload() {
            Payload::Str(b) if b.len() <= MAX_INT_DIGITS => parse_int_strict(b),
            _ => None,
        };
        match parsed {
            Some(n) => {
                if allow_shared {
                    if let Some(shared) = shared_integer(n) {
                        return shared;
                    }
                }
                let mut obj = Arc::try_unwrap(arc).expect("sole owner checked above");
                obj.payload = Payload::Int(n);
                ObjRef::Counted(Arc::new(obj))
            }
            None => ObjRef::Counted(arc),
        }
    }
}

/// Decimal digit count including the sign, without formatting.
fn int_digits(n: i64) -> usize {
    if n == 0 {
        return 1;
    }
    let negative = n < 0;
    let magnitude = n.unsigned_abs();
    (magnitude.ilog10() as usize + 1) + usize::from(negative)
}

/// Parses a canonical decimal i64: optional `-`, no leading zeros, no
/// leading `+`, the whole slice consumed. Mirrors the encoding rule —
/// only strings that round-trip exactly become integer-encoded.
pub fn parse_int_strict(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes.len() > MAX_INT_DIGITS {
        return None;
    }
    let (negative, digits) = match bytes[0] {
        b'-' => (true, &bytes[1..]),
        _ => (false, bytes),
    };
    if digits.is_empty() {
        return None;
    }
    if digits[0] == b'0' && digits.len() > 1 {
        return None;
    }
    if negative && digits == b"0" {
        return None; // "-0" does not round-trip
    }
    let mut value: i64 = 0;
    for &d in digits {
        if !d.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?;
        value = if negative {
            value.checked_sub((d - b'0') as i64)?
        } else {
            value.checked_add((d - b'0') as i64)?
        };
    }
    Some(value)
}

/// Returns the shared singleton for integers in `[0, SHARED_INTEGER_CAP)`.
pub fn shared_integer(n: i64) -> Option<ObjRef> {
    if !(0..SHARED_INTEGER_CAP).contains(&n) {
        return None;
    }
    static SINGLETONS: OnceLock<Vec<Object>> = OnceLock::new();
    let table = SINGLETONS.get_or_init(|| {
        (0..SHARED_INTEGER_CAP)
            .map(|i| {
                let obj = Object::new(Payload::Int(i));
                obj.set_mvcc(0);
                obj
            })
            .collect()
    });
    Some(ObjRef::Shared(&table[n as usize]))
}
