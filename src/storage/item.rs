//! The discriminated value cell every higher layer operates on.
//!
//! An [`Item`] carries exactly one payload shape (byte string, list, or
//! field dictionary), an optional wall-clock expiry, and its own
//! reader/writer lock. The storage map hands out `Arc<Item>` handles and
//! callers lock the item themselves for the duration of observation or
//! mutation. Bucket locks are always taken before item locks, never the
//! other way around.
//!
//! Accessing a payload through the wrong kind is a broken invariant, not a
//! runtime condition, and panics.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

/// Discriminant of an item's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Bytes,
    List,
    Dict,
}

impl Kind {
    /// Single-byte tag used in the snapshot encoding.
    pub fn as_u8(self) -> u8 {
        match self {
            Kind::Bytes => 0,
            Kind::List => 1,
            Kind::Dict => 2,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Kind::Bytes),
            1 => Some(Kind::List),
            2 => Some(Kind::Dict),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Bytes => "bytes",
            Kind::List => "list",
            Kind::Dict => "dict",
        }
    }
}

/// One live payload per kind.
///
/// Lists keep their head at the LAST slot: pushing to the head is an
/// append, popping the head is a pop from the end, and the external index
/// `i` maps to `len - 1 - i`. The translation is confined to the list
/// operations in the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bytes(Bytes),
    List(Vec<Bytes>),
    Dict(HashMap<String, Bytes>),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Bytes(_) => Kind::Bytes,
            Value::List(_) => Kind::List,
            Value::Dict(_) => Kind::Dict,
        }
    }
}

/// Payload and expiry, guarded by the item's lock.
#[derive(Debug)]
pub struct ItemData {
    value: Value,
    expire_at: Option<SystemTime>,
}

impl ItemData {
    pub fn kind(&self) -> Kind {
        self.value.kind()
    }

    /// Byte-string payload. Panics on any other kind.
    pub fn bytes(&self) -> &Bytes {
        match &self.value {
            Value::Bytes(b) => b,
            other => panic!(
                "program logic error: bytes payload requested on a {} item",
                other.kind().as_str()
            ),
        }
    }

    /// List payload in internal order (head last). Panics on any other kind.
    pub fn list(&self) -> &Vec<Bytes> {
        match &self.value {
            Value::List(l) => l,
            other => panic!(
                "program logic error: list payload requested on a {} item",
                other.kind().as_str()
            ),
        }
    }

    pub fn list_mut(&mut self) -> &mut Vec<Bytes> {
        match &mut self.value {
            Value::List(l) => l,
            other => panic!(
                "program logic error: list payload requested on a {} item",
                other.kind().as_str()
            ),
        }
    }

    /// Dictionary payload. Panics on any other kind.
    pub fn dict(&self) -> &HashMap<String, Bytes> {
        match &self.value {
            Value::Dict(d) => d,
            other => panic!(
                "program logic error: dict payload requested on a {} item",
                other.kind().as_str()
            ),
        }
    }

    pub fn dict_mut(&mut self) -> &mut HashMap<String, Bytes> {
        match &mut self.value {
            Value::Dict(d) => d,
            other => panic!(
                "program logic error: dict payload requested on a {} item",
                other.kind().as_str()
            ),
        }
    }

    /// Replaces the payload with one of the same kind. Panics on mismatch.
    pub fn replace(&mut self, value: Value) {
        assert!(
            self.value.kind() == value.kind(),
            "program logic error: replacing a {} payload with a {} payload",
            self.value.kind().as_str(),
            value.kind().as_str()
        );
        self.value = value;
    }

    /// Arms the TTL. `seconds` must be positive; anything else is a
    /// programming error on the caller's side.
    pub fn set_ttl_seconds(&mut self, seconds: i64) {
        assert!(seconds > 0, "program logic error: non-positive TTL {seconds}");
        self.expire_at = Some(SystemTime::now() + Duration::from_secs(seconds as u64));
    }

    pub fn set_ttl_millis(&mut self, millis: i64) {
        assert!(millis > 0, "program logic error: non-positive TTL {millis}ms");
        self.expire_at = Some(SystemTime::now() + Duration::from_millis(millis as u64));
    }

    /// Drops the TTL; returns whether one was set.
    pub fn clear_ttl(&mut self) -> bool {
        self.expire_at.take().is_some()
    }

    pub fn has_ttl(&self) -> bool {
        self.expire_at.is_some()
    }

    /// Remaining TTL in whole seconds, rounded to nearest, clamped to >= 0.
    /// Only meaningful when a TTL is set.
    pub fn ttl_seconds(&self) -> i64 {
        let Some(expire_at) = self.expire_at else {
            return 0;
        };
        match expire_at.duration_since(SystemTime::now()) {
            Ok(remaining) => ((remaining.as_millis() + 500) / 1000) as i64,
            Err(_) => 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expire_at {
            Some(expire_at) => expire_at <= SystemTime::now(),
            None => false,
        }
    }

    /// Absolute expiry, for snapshot encoding.
    pub fn expire_at(&self) -> Option<SystemTime> {
        self.expire_at
    }
}

/// A stored value cell with an embedded reader/writer lock.
#[derive(Debug)]
pub struct Item {
    data: RwLock<ItemData>,
}

impl Item {
    /// Creates a byte-string item.
    pub fn new_bytes(bytes: Bytes) -> Self {
        Self::from_value(Value::Bytes(bytes), None)
    }

    /// Creates a list item; `list` is in internal order (head last).
    pub fn new_list(list: Vec<Bytes>) -> Self {
        Self::from_value(Value::List(list), None)
    }

    /// Creates a dictionary item.
    pub fn new_dict(dict: HashMap<String, Bytes>) -> Self {
        Self::from_value(Value::Dict(dict), None)
    }

    /// Creates an item with an explicit expiry, used when decoding a
    /// snapshot.
    pub fn from_value(value: Value, expire_at: Option<SystemTime>) -> Self {
        Self {
            data: RwLock::new(ItemData { value, expire_at }),
        }
    }

    /// Shared access for observation.
    pub fn read(&self) -> RwLockReadGuard<'_, ItemData> {
        self.data.read().unwrap()
    }

    /// Exclusive access for mutation.
    pub fn write(&self) -> RwLockWriteGuard<'_, ItemData> {
        self.data.write().unwrap()
    }
}
