//! Sharded concurrent map from keys to item handles.
//!
//! Keys are spread over a fixed array of buckets, each holding its own
//! `HashMap` behind its own reader/writer lock. Sharding the keyspace is
//! worth roughly an order of magnitude in throughput over a single locked
//! map once the keyspace is wide and the connection count is high.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                       Storage                        │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐              │
//! │  │ bucket 0 │ │ bucket 1 │ │ ...1024  │              │
//! │  │ RwLock   │ │ RwLock   │ │          │              │
//! │  │ HashMap  │ │ HashMap  │ │          │              │
//! │  └──────────┘ └──────────┘ └──────────┘              │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The storage exclusively owns its items; callers receive `Arc<Item>`
//! observation handles and relock the item as needed. Lock order is always
//! bucket first, then item.

use crate::storage::item::{Item, ItemData, Kind, Value};
use bytes::{BufMut, Bytes};
use std::collections::HashMap;
use std::hash::Hasher;
use std::io::{self, Read, Write};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use twox_hash::XxHash64;

/// Number of buckets. A pure function of the key decides the bucket, so
/// the on-disk snapshot stays bucket-agnostic: loading rehashes every key.
pub const BUCKET_COUNT: usize = 1024;

/// Errors from snapshot encoding and decoding.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupted snapshot: {0}")]
    Corrupted(String),

    #[error("load requires an empty storage")]
    NonEmpty,
}

struct Bucket {
    map: RwLock<HashMap<String, Arc<Item>>>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

/// Sharded associative container over item handles.
pub struct Storage {
    buckets: Vec<Bucket>,
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::new()).collect(),
        }
    }

    #[inline]
    fn bucket(&self, key: &str) -> &Bucket {
        &self.buckets[bucket_index(key)]
    }

    /// Returns the handle stored under `key`, expired or not.
    pub fn get(&self, key: &str) -> Option<Arc<Item>> {
        let map = self.bucket(key).map.read().unwrap();
        map.get(key).cloned()
    }

    /// Returns handles for every present key, taking each involved bucket's
    /// read lock exactly once. Missing keys are absent from the result.
    pub fn get_many(&self, keys: &[String]) -> HashMap<String, Arc<Item>> {
        let mut by_bucket: Vec<Vec<&String>> = vec![Vec::new(); BUCKET_COUNT];
        for key in keys {
            by_bucket[bucket_index(key)].push(key);
        }

        let mut result = HashMap::with_capacity(keys.len());
        for (bucket, bucket_keys) in self.buckets.iter().zip(&by_bucket) {
            if bucket_keys.is_empty() {
                continue;
            }
            let map = bucket.map.read().unwrap();
            for key in bucket_keys {
                if let Some(item) = map.get(*key) {
                    result.insert((*key).clone(), Arc::clone(item));
                }
            }
        }

        result
    }

    /// Inserts or replaces a single item.
    pub fn put_one(&self, key: String, item: Arc<Item>) {
        let mut map = self.bucket(&key).map.write().unwrap();
        map.insert(key, item);
    }

    /// Removes the given keys, taking each involved bucket's write lock
    /// exactly once. Returns how many keys were actually present.
    pub fn del(&self, keys: &[String]) -> usize {
        let mut by_bucket: Vec<Vec<&String>> = vec![Vec::new(); BUCKET_COUNT];
        for key in keys {
            by_bucket[bucket_index(key)].push(key);
        }

        let mut count = 0;
        for (bucket, bucket_keys) in self.buckets.iter().zip(&by_bucket) {
            if bucket_keys.is_empty() {
                continue;
            }
            let mut map = bucket.map.write().unwrap();
            for key in bucket_keys {
                if map.remove(*key).is_some() {
                    count += 1;
                }
            }
        }

        count
    }

    /// Compare-and-swap bulk delete: removes a key only while it still maps
    /// to the exact handle provided. A key overwritten since it was
    /// observed is spared, which is what lets expiry collection run
    /// concurrently with client writes.
    pub fn del_if_same(&self, submap: &HashMap<String, Arc<Item>>) -> usize {
        let mut by_bucket: Vec<Vec<&String>> = vec![Vec::new(); BUCKET_COUNT];
        for key in submap.keys() {
            by_bucket[bucket_index(key)].push(key);
        }

        let mut count = 0;
        for (bucket, bucket_keys) in self.buckets.iter().zip(&by_bucket) {
            if bucket_keys.is_empty() {
                continue;
            }
            let mut map = bucket.map.write().unwrap();
            for key in bucket_keys {
                let same = match (map.get(*key), submap.get(*key)) {
                    (Some(current), Some(observed)) => Arc::ptr_eq(current, observed),
                    _ => false,
                };
                if same {
                    map.remove(*key);
                    count += 1;
                }
            }
        }

        count
    }

    /// All keys, visiting every bucket under its read lock. The result is
    /// an approximate snapshot with no cross-bucket atomicity.
    pub fn keys(&self) -> Vec<String> {
        let mut total = 0;
        for bucket in &self.buckets {
            total += bucket.map.read().unwrap().len();
        }

        let mut keys = Vec::with_capacity(total + total / 100);
        for bucket in &self.buckets {
            let map = bucket.map.read().unwrap();
            keys.extend(map.keys().cloned());
        }

        keys
    }

    /// Number of stored keys, expired items included.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.map.read().unwrap().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the last applied sequence id and every item into `w`.
    ///
    /// Takes every bucket write lock in index order and then every item
    /// write lock, so nothing can observe or mutate the storage mid-dump;
    /// all locks release in reverse order when the guards drop.
    pub fn persist<W: Write>(&self, w: &mut W, last_sequence_id: i64) -> Result<(), StorageError> {
        let bucket_guards: Vec<_> = self
            .buckets
            .iter()
            .map(|b| b.map.write().unwrap())
            .collect();

        let mut items: Vec<(&String, Arc<Item>)> = Vec::new();
        for guard in &bucket_guards {
            for (key, item) in guard.iter() {
                items.push((key, Arc::clone(item)));
            }
        }
        let item_guards: Vec<_> = items.iter().map(|(_, item)| item.write()).collect();

        w.write_all(&last_sequence_id.to_le_bytes())?;

        let mut buf = Vec::new();
        for ((key, _), data) in items.iter().zip(item_guards.iter()) {
            encode_item(&mut buf, key, data);
            w.write_all(&buf)?;
            buf.clear();
        }

        Ok(())
    }

    /// Rebuilds the storage from a snapshot stream and returns the last
    /// applied sequence id. Only an empty storage may be loaded into; the
    /// bucket layout is reconstructed by rehashing each key.
    pub fn load<R: Read>(&self, r: &mut R) -> Result<i64, StorageError> {
        let mut guards: Vec<_> = self
            .buckets
            .iter()
            .map(|b| b.map.write().unwrap())
            .collect();
        if guards.iter().any(|g| !g.is_empty()) {
            return Err(StorageError::NonEmpty);
        }

        let mut id_buf = [0u8; 8];
        r.read_exact(&mut id_buf)?;
        let last_sequence_id = i64::from_le_bytes(id_buf);

        while let Some((key, item)) = decode_item(r)? {
            guards[bucket_index(&key)].insert(key, Arc::new(item));
        }

        Ok(last_sequence_id)
    }
}

#[inline]
fn bucket_index(key: &str) -> usize {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key.as_bytes());
    (hasher.finish() % BUCKET_COUNT as u64) as usize
}

// Snapshot record layout, all integers little-endian:
//   u32 key len, key bytes
//   i64 expiry as nanoseconds since the epoch, 0 for none
//   u8 kind tag
//   payload: Bytes   -> u32 len + bytes
//            List    -> u32 count, then u32 len + bytes each (internal order)
//            Dict    -> u32 count, then (u32 len + field, u32 len + value)
// EOF at a record boundary ends the stream.

fn encode_item(buf: &mut Vec<u8>, key: &str, data: &ItemData) {
    buf.put_u32_le(key.len() as u32);
    buf.put_slice(key.as_bytes());
    buf.put_i64_le(expire_at_nanos(data.expire_at()));
    buf.put_u8(data.kind().as_u8());
    match data.kind() {
        Kind::Bytes => {
            let bytes = data.bytes();
            buf.put_u32_le(bytes.len() as u32);
            buf.put_slice(bytes);
        }
        Kind::List => {
            let list = data.list();
            buf.put_u32_le(list.len() as u32);
            for value in list {
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
        }
        Kind::Dict => {
            let dict = data.dict();
            buf.put_u32_le(dict.len() as u32);
            for (field, value) in dict {
                buf.put_u32_le(field.len() as u32);
                buf.put_slice(field.as_bytes());
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
        }
    }
}

fn decode_item<R: Read>(r: &mut R) -> Result<Option<(String, Item)>, StorageError> {
    let key_len = match read_u32(r) {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let key = String::from_utf8(read_blob(r, key_len)?)
        .map_err(|_| StorageError::Corrupted("key is not valid UTF-8".to_string()))?;

    let expire_at = nanos_to_expire_at(read_i64(r)?);
    let tag = read_u8(r)?;
    let kind = Kind::from_u8(tag)
        .ok_or_else(|| StorageError::Corrupted(format!("unknown kind tag {tag}")))?;

    let value = match kind {
        Kind::Bytes => {
            let len = read_u32(r)? as usize;
            Value::Bytes(Bytes::from(read_blob(r, len)?))
        }
        Kind::List => {
            let count = read_u32(r)? as usize;
            let mut list = Vec::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                let len = read_u32(r)? as usize;
                list.push(Bytes::from(read_blob(r, len)?));
            }
            Value::List(list)
        }
        Kind::Dict => {
            let count = read_u32(r)? as usize;
            let mut dict = HashMap::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                let field_len = read_u32(r)? as usize;
                let field = String::from_utf8(read_blob(r, field_len)?).map_err(|_| {
                    StorageError::Corrupted("dict field is not valid UTF-8".to_string())
                })?;
                let value_len = read_u32(r)? as usize;
                dict.insert(field, Bytes::from(read_blob(r, value_len)?));
            }
            Value::Dict(dict)
        }
    };

    Ok(Some((key, Item::from_value(value, expire_at))))
}

fn expire_at_nanos(expire_at: Option<SystemTime>) -> i64 {
    match expire_at {
        Some(at) => at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0),
        None => 0,
    }
}

fn nanos_to_expire_at(nanos: i64) -> Option<SystemTime> {
    if nanos == 0 {
        None
    } else {
        Some(UNIX_EPOCH + Duration::from_nanos(nanos as u64))
    }
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_blob<R: Read>(r: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}
