//! Stored values: payload, type tag, encoding hint, access-recency
//! metadata, MVCC stamp, and the expire flag.
//!
//! Values come in two representations: owned outright, or borrowed
//! from the immutable shared pool of small integers. Shared values
//! cannot carry per-instance state, so any mutation that needs one
//! (setting the expire flag, stamping MVCC) transparently upgrades the
//! value to an owned copy first.

use std::collections::VecDeque;
use std::sync::OnceLock;

use bytes::Bytes;

use crate::dict::Dict;

/// Type tag, as reported by TYPE-style introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    List,
    Hash,
    Set,
    ZSet,
    Stream,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::List => "list",
            ValueType::Hash => "hash",
            ValueType::Set => "set",
            ValueType::ZSet => "zset",
            ValueType::Stream => "stream",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "string" => ValueType::String,
            "list" => ValueType::List,
            "hash" => ValueType::Hash,
            "set" => ValueType::Set,
            "zset" => ValueType::ZSet,
            "stream" => ValueType::Stream,
            _ => return None,
        })
    }

    /// Types that can satisfy a blocked pop-style waiter.
    pub fn supports_blocking(self) -> bool {
        matches!(self, ValueType::List | ValueType::ZSet | ValueType::Stream)
    }
}

/// Representation hint: compact encodings hold few elements and are
/// scanned in one shot; table encodings get cursor iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    Int,
    Listpack,
    HashTable,
    IntSet,
    SkipList,
    Stream,
}

impl Encoding {
    /// Compact encodings cannot be mutated in place.
    pub fn is_compact(self) -> bool {
        !matches!(self, Encoding::Raw | Encoding::HashTable | Encoding::SkipList)
    }
}

/// Hash payload: listpack below the conversion threshold, hash table above.
#[derive(Debug, Clone, PartialEq)]
pub enum HashRepr {
    Pack(Vec<(Bytes, Bytes)>),
    Table(Dict<Bytes>),
}

/// Set payload: sorted integer vector or hash table of members.
#[derive(Debug, Clone, PartialEq)]
pub enum SetRepr {
    Ints(Vec<i64>),
    Table(Dict<()>),
}

/// Sorted-set payload: listpack of (member, score) or the table side of
/// a skiplist encoding (the ordered side lives with the type's own
/// implementation; the engine only needs the member table for SCAN).
#[derive(Debug, Clone, PartialEq)]
pub enum ZSetRepr {
    Pack(Vec<(Bytes, f64)>),
    Table(Dict<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: (u64, u64),
    pub fields: Vec<(Bytes, Bytes)>,
}

/// Type-specific payload. Carries enough structure for type tags,
/// SCAN visitors, and blocking-type checks; command semantics over
/// these representations belong to external collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Str(Bytes),
    List(VecDeque<Bytes>),
    Hash(HashRepr),
    Set(SetRepr),
    ZSet(ZSetRepr),
    Stream(Vec<StreamEntry>),
}

impl Payload {
    pub fn value_type(&self) -> ValueType {
        match self {
            Payload::Str(_) => ValueType::String,
            Payload::List(_) => ValueType::List,
            Payload::Hash(_) => ValueType::Hash,
            Payload::Set(_) => ValueType::Set,
            Payload::ZSet(_) => ValueType::ZSet,
            Payload::Stream(_) => ValueType::Stream,
        }
    }
}

/// Newly created values start with a moderate LFU counter so they are
/// not immediately reclaimed before proving themselves.
pub(crate) const LFU_INIT_VAL: u8 = 5;

/// Minutes wrap at 16 bits inside the packed access field.
const LFU_MINUTE_MASK: u32 = 0xFFFF;

fn lfu_minutes(now_ms: u64) -> u32 {
    ((now_ms / 60_000) as u32) & LFU_MINUTE_MASK
}

/// The data every stored value carries besides its payload.
#[derive(Debug, Clone)]
pub struct ValueObj {
    payload: Payload,
    encoding: Encoding,
    /// Either an LRU clock stamp (seconds) or a packed LFU pair of
    /// `(last_decay_minute << 8) | log_counter`.
    access: u32,
    mvcc: u64,
    has_expire: bool,
}

/// A stored value.
#[derive(Debug)]
pub enum Value {
    Owned(Box<ValueObj>),
    /// Interned in the global pool. Immutable; carries no per-instance
    /// flags or recency state.
    Shared(&'static ValueObj),
}

impl Clone for Value {
    /// Deep for owned values (the clone is detached — later mutations
    /// of either copy never leak into the other), pointer-cheap for
    /// shared ones. Preserves the MVCC stamp.
    fn clone(&self) -> Self {
        match self {
            Value::Owned(obj) => Value::Owned(obj.clone()),
            Value::Shared(obj) => Value::Shared(obj),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.payload() == other.payload()
    }
}

impl Value {
    fn from_obj(payload: Payload, encoding: Encoding) -> Self {
        Value::Owned(Box::new(ValueObj {
            payload,
            encoding,
            access: 0,
            mvcc: 0,
            has_expire: false,
        }))
    }

    pub fn string(data: Bytes) -> Self {
        Self::from_obj(Payload::Str(data), Encoding::Raw)
    }

    /// An integer-encoded string, from the shared pool when possible.
    pub fn int(n: i64) -> Self {
        shared_int(n).unwrap_or_else(|| {
            Self::from_obj(Payload::Str(Bytes::from(n.to_string())), Encoding::Int)
        })
    }

    pub fn list(items: VecDeque<Bytes>) -> Self {
        Self::from_obj(Payload::List(items), Encoding::Listpack)
    }

    pub fn hash(repr: HashRepr) -> Self {
        let encoding = match &repr {
            HashRepr::Pack(_) => Encoding::Listpack,
            HashRepr::Table(_) => Encoding::HashTable,
        };
        Self::from_obj(Payload::Hash(repr), encoding)
    }

    pub fn set(repr: SetRepr) -> Self {
        let encoding = match &repr {
            SetRepr::Ints(_) => Encoding::IntSet,
            SetRepr::Table(_) => Encoding::HashTable,
        };
        Self::from_obj(Payload::Set(repr), encoding)
    }

    pub fn zset(repr: ZSetRepr) -> Self {
        let encoding = match &repr {
            ZSetRepr::Pack(_) => Encoding::Listpack,
            ZSetRepr::Table(_) => Encoding::SkipList,
        };
        Self::from_obj(Payload::ZSet(repr), encoding)
    }

    pub fn stream(entries: Vec<StreamEntry>) -> Self {
        Self::from_obj(Payload::Stream(entries), Encoding::Stream)
    }

    fn obj(&self) -> &ValueObj {
        match self {
            Value::Owned(obj) => obj,
            Value::Shared(obj) => obj,
        }
    }

    /// Upgrades a shared value to an owned copy and returns mutable
    /// access to the bookkeeping.
    fn make_owned(&mut self) -> &mut ValueObj {
        if let Value::Shared(obj) = self {
            *self = Value::Owned(Box::new((*obj).clone()));
        }
        match self {
            Value::Owned(obj) => obj,
            Value::Shared(_) => unreachable!("just upgraded"),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Value::Shared(_))
    }

    pub fn value_type(&self) -> ValueType {
        self.obj().payload.value_type()
    }

    pub fn encoding(&self) -> Encoding {
        self.obj().encoding
    }

    pub fn payload(&self) -> &Payload {
        &self.obj().payload
    }

    /// Mutable payload access; upgrades shared values.
    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.make_owned().payload
    }

    pub fn as_str(&self) -> Option<&Bytes> {
        match self.payload() {
            Payload::Str(data) => Some(data),
            _ => None,
        }
    }

    pub fn mvcc(&self) -> u64 {
        self.obj().mvcc
    }

    pub fn set_mvcc(&mut self, stamp: u64) {
        self.make_owned().mvcc = stamp;
    }

    pub fn has_expire(&self) -> bool {
        self.obj().has_expire
    }

    pub fn set_expire_flag(&mut self, flag: bool) {
        self.make_owned().has_expire = flag;
    }

    pub fn access_raw(&self) -> u32 {
        self.obj().access
    }

    /// Carries recency metadata over from a replaced value.
    pub fn set_access_raw(&mut self, access: u32) {
        self.make_owned().access = access;
    }

    /// Stamps the LRU clock. No-op on shared values (the pool is never
    /// reclaimed, so their recency is meaningless).
    pub fn touch_lru(&mut self, now_ms: u64) {
        if let Value::Owned(obj) = self {
            obj.access = (now_ms / 1000) as u32;
        }
    }

    /// Applies the LFU discipline: decay the counter by elapsed
    /// minutes, then increment it logarithmically. No-op on shared
    /// values.
    pub fn touch_lfu(&mut self, now_ms: u64, log_factor: u8, decay_minutes: u8) {
        let Value::Owned(obj) = self else {
            return;
        };
        let now_min = lfu_minutes(now_ms);
        let counter = lfu_decr(obj.access, now_min, decay_minutes);
        let counter = lfu_incr(counter, log_factor);
        obj.access = (now_min << 8) | counter as u32;
    }

    /// The current LFU counter, after decay at `now_ms`.
    pub fn lfu_counter(&self, now_ms: u64, decay_minutes: u8) -> u8 {
        lfu_decr(self.obj().access, lfu_minutes(now_ms), decay_minutes)
    }

    /// Rough size gate for the background dropper: small values are
    /// cheaper to drop inline than to ship across a channel.
    pub(crate) fn is_large(&self) -> bool {
        match self.payload() {
            Payload::Str(data) => data.len() > 4096,
            Payload::List(items) => items.len() > 64,
            Payload::Hash(HashRepr::Pack(items)) => items.len() > 64,
            Payload::Hash(HashRepr::Table(table)) => table.len() > 64,
            Payload::Set(SetRepr::Ints(items)) => items.len() > 64,
            Payload::Set(SetRepr::Table(table)) => table.len() > 64,
            Payload::ZSet(ZSetRepr::Pack(items)) => items.len() > 64,
            Payload::ZSet(ZSetRepr::Table(table)) => table.len() > 64,
            Payload::Stream(entries) => entries.len() > 64,
        }
    }
}

fn lfu_decr(access: u32, now_min: u32, decay_minutes: u8) -> u8 {
    let last_min = access >> 8;
    let counter = (access & 0xFF) as u8;
    if decay_minutes == 0 {
        return counter;
    }
    let elapsed = now_min.wrapping_sub(last_min) & LFU_MINUTE_MASK;
    let periods = (elapsed / decay_minutes as u32).min(u32::from(u8::MAX));
    counter.saturating_sub(periods as u8)
}

fn lfu_incr(counter: u8, log_factor: u8) -> u8 {
    use rand::Rng;
    if counter == u8::MAX {
        return counter;
    }
    let r: f64 = rand::rng().random();
    let baseval = counter.saturating_sub(LFU_INIT_VAL) as f64;
    let p = 1.0 / (baseval * log_factor as f64 + 1.0);
    if r < p {
        counter + 1
    } else {
        counter
    }
}

/// Size of the interned integer pool.
const SHARED_INTEGERS: i64 = 10_000;

fn shared_pool() -> &'static [ValueObj] {
    static POOL: OnceLock<Vec<ValueObj>> = OnceLock::new();
    POOL.get_or_init(|| {
        (0..SHARED_INTEGERS)
            .map(|n| ValueObj {
                payload: Payload::Str(Bytes::from(n.to_string())),
                encoding: Encoding::Int,
                access: 0,
                mvcc: 0,
                has_expire: false,
            })
            .collect()
    })
}

/// Looks up the interned value for a small non-negative integer.
pub fn shared_int(n: i64) -> Option<Value> {
    if (0..SHARED_INTEGERS).contains(&n) {
        Some(Value::Shared(&shared_pool()[n as usize]))
    } else {
        None
    }
}
