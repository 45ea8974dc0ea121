//! Redis-like command semantics over the sharded storage.
//!
//! The core is a stateless façade: every operation resolves the key, checks
//! the item's kind, applies the TTL rules, and performs the index math for
//! lists. An item that exists but has expired is treated as absent without
//! being deleted here; removal belongs to [`Core::collect_expired`], which
//! the controller drives from a background worker.
//!
//! Locking per operation follows the storage discipline: bucket lock for
//! the map lookup, dropped before the item's own lock is taken.

pub mod glob;

use crate::storage::{Item, Kind, Storage, StorageError};
use bytes::Bytes;
use glob::glob_match;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use thiserror::Error;

/// Domain errors surfaced to the command dispatcher.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// Key, field, or index is absent, or the item has expired.
    #[error("key not found")]
    NotFound,

    /// The key holds a different kind than the command expects.
    #[error("operation against a key holding the wrong kind of value")]
    WrongType,

    /// List write against a missing key; carries distinct wire text.
    #[error("no such key")]
    NoSuchKey,

    /// List write against an index outside the list.
    #[error("index out of range")]
    InvalidIndex,
}

/// Tunables, explicit fields rather than process-wide statics so tests can
/// pin them per instance.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// How many keys the expiry collector inspects per batch.
    pub collect_expired_batch_size: usize,
    /// Whether KEYS filters out expired entries.
    pub keys_check_ttl: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            collect_expired_batch_size: 100,
            keys_check_ttl: true,
        }
    }
}

/// Domain operations on the storage.
pub struct Core {
    storage: Storage,
    config: CoreConfig,
}

impl Core {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            storage: Storage::new(),
            config,
        }
    }

    /// Resolves a key to its handle, treating expired items as absent.
    fn live(&self, key: &str) -> Option<Arc<Item>> {
        let item = self.storage.get(key)?;
        if item.read().is_expired() {
            None
        } else {
            Some(item)
        }
    }

    /// All keys matching the glob `pattern`, with expired keys filtered
    /// out when the configuration asks for it.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let mut result = Vec::new();
        for key in self.storage.keys() {
            if !glob_match(pattern, &key) {
                continue;
            }
            if self.config.keys_check_ttl && self.live(&key).is_none() {
                continue;
            }
            result.push(key);
        }
        result
    }

    /// Value of a byte-string key; the returned handle shares no mutable
    /// state with the stored item.
    pub fn get(&self, key: &str) -> Result<Bytes, CoreError> {
        let item = self.live(key).ok_or(CoreError::NotFound)?;
        let data = item.read();
        if data.kind() != Kind::Bytes {
            return Err(CoreError::WrongType);
        }
        Ok(data.bytes().clone())
    }

    /// Sets `key` to a byte string, replacing any previous item and
    /// discarding its TTL.
    pub fn set(&self, key: &str, value: Bytes) {
        self.storage
            .put_one(key.to_string(), Arc::new(Item::new_bytes(value)));
    }

    /// Sets `key` with a TTL. A non-positive TTL deletes the key instead.
    pub fn set_ex(&self, key: &str, seconds: i64, value: Bytes) {
        if seconds <= 0 {
            self.storage.del(&[key.to_string()]);
            return;
        }
        let item = Item::new_bytes(value);
        item.write().set_ttl_seconds(seconds);
        self.storage.put_one(key.to_string(), Arc::new(item));
    }

    /// Removes keys, returning how many were present. An expired item that
    /// the collector has not removed yet still counts.
    pub fn del(&self, keys: &[String]) -> i64 {
        self.storage.del(keys) as i64
    }

    /// Sets a dictionary field; 1 when the field is new, 0 on overwrite.
    /// Creates the dictionary when the key is missing or expired.
    pub fn dict_set(&self, key: &str, field: &str, value: Bytes) -> Result<i64, CoreError> {
        match self.live(key) {
            Some(item) => {
                let mut data = item.write();
                if data.kind() != Kind::Dict {
                    return Err(CoreError::WrongType);
                }
                let previous = data.dict_mut().insert(field.to_string(), value);
                Ok(if previous.is_some() { 0 } else { 1 })
            }
            None => {
                let mut dict = HashMap::new();
                dict.insert(field.to_string(), value);
                self.storage
                    .put_one(key.to_string(), Arc::new(Item::new_dict(dict)));
                Ok(1)
            }
        }
    }

    /// Value of a dictionary field; missing key and missing field both
    /// resolve to `NotFound`.
    pub fn dict_get(&self, key: &str, field: &str) -> Result<Bytes, CoreError> {
        let item = self.live(key).ok_or(CoreError::NotFound)?;
        let data = item.read();
        if data.kind() != Kind::Dict {
            return Err(CoreError::WrongType);
        }
        data.dict().get(field).cloned().ok_or(CoreError::NotFound)
    }

    /// Field names of a dictionary; a missing key yields an empty list.
    pub fn dict_keys(&self, key: &str) -> Result<Vec<String>, CoreError> {
        let Some(item) = self.live(key) else {
            return Ok(Vec::new());
        };
        let data = item.read();
        if data.kind() != Kind::Dict {
            return Err(CoreError::WrongType);
        }
        Ok(data.dict().keys().cloned().collect())
    }

    /// All fields and values interleaved; a missing key yields an empty
    /// list.
    pub fn dict_get_all(&self, key: &str) -> Result<Vec<Bytes>, CoreError> {
        let Some(item) = self.live(key) else {
            return Ok(Vec::new());
        };
        let data = item.read();
        if data.kind() != Kind::Dict {
            return Err(CoreError::WrongType);
        }
        let dict = data.dict();
        let mut result = Vec::with_capacity(dict.len() * 2);
        for (field, value) in dict {
            result.push(Bytes::from(field.clone().into_bytes()));
            result.push(value.clone());
        }
        Ok(result)
    }

    /// Removes dictionary fields, returning how many existed. A missing
    /// key yields 0.
    pub fn dict_del(&self, key: &str, fields: &[String]) -> Result<i64, CoreError> {
        let Some(item) = self.live(key) else {
            return Ok(0);
        };
        let mut data = item.write();
        if data.kind() != Kind::Dict {
            return Err(CoreError::WrongType);
        }
        let dict = data.dict_mut();
        let mut count = 0;
        for field in fields {
            if dict.remove(field).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Length of a list; a missing key yields 0.
    pub fn list_len(&self, key: &str) -> Result<i64, CoreError> {
        let Some(item) = self.live(key) else {
            return Ok(0);
        };
        let data = item.read();
        if data.kind() != Kind::List {
            return Err(CoreError::WrongType);
        }
        Ok(data.list().len() as i64)
    }

    /// Inclusive slice of a list with external indexing, head at index 0.
    /// Negative indices count from the tail. Out-of-range boundaries clamp
    /// and a reversed range yields an empty result, never an error.
    pub fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>, CoreError> {
        let Some(item) = self.live(key) else {
            return Ok(Vec::new());
        };
        let data = item.read();
        if data.kind() != Kind::List {
            return Err(CoreError::WrongType);
        }
        let list = data.list();
        let len = list.len() as i64;

        let mut start = if start < 0 { len + start } else { start };
        let mut stop = if stop < 0 { len + stop } else { stop };
        if start < 0 {
            start = 0;
        }
        if stop > len - 1 {
            stop = len - 1;
        }
        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        // External [start, stop] is internal [len-1-stop, len-1-start],
        // read back to front.
        let lo = (len - 1 - stop) as usize;
        let hi = (len - 1 - start) as usize;
        Ok(list[lo..=hi].iter().rev().cloned().collect())
    }

    /// Element at an external index; negative indices count from the tail.
    pub fn list_index(&self, key: &str, index: i64) -> Result<Bytes, CoreError> {
        let Some(item) = self.live(key) else {
            return Err(CoreError::NotFound);
        };
        let data = item.read();
        if data.kind() != Kind::List {
            return Err(CoreError::WrongType);
        }
        let list = data.list();
        let len = list.len() as i64;
        let index = if index < 0 { len + index } else { index };
        if index < 0 || index >= len {
            return Err(CoreError::NotFound);
        }
        Ok(list[(len - 1 - index) as usize].clone())
    }

    /// Replaces the element at an external index.
    pub fn list_set(&self, key: &str, index: i64, value: Bytes) -> Result<(), CoreError> {
        let Some(item) = self.live(key) else {
            return Err(CoreError::NoSuchKey);
        };
        let mut data = item.write();
        if data.kind() != Kind::List {
            return Err(CoreError::WrongType);
        }
        let len = data.list().len() as i64;
        let index = if index < 0 { len + index } else { index };
        if index < 0 || index >= len {
            return Err(CoreError::InvalidIndex);
        }
        data.list_mut()[(len - 1 - index) as usize] = value;
        Ok(())
    }

    /// Pushes values at the head so that argument order becomes head
    /// order: after `list_push(k, [a, b, c])` the head reads a, b, c.
    /// Returns the new length; creates the list when the key is missing or
    /// expired.
    pub fn list_push(&self, key: &str, values: Vec<Bytes>) -> Result<i64, CoreError> {
        match self.live(key) {
            Some(item) => {
                let mut data = item.write();
                if data.kind() != Kind::List {
                    return Err(CoreError::WrongType);
                }
                let list = data.list_mut();
                for value in values.into_iter().rev() {
                    list.push(value);
                }
                Ok(list.len() as i64)
            }
            None => {
                let list: Vec<Bytes> = values.into_iter().rev().collect();
                let len = list.len() as i64;
                self.storage
                    .put_one(key.to_string(), Arc::new(Item::new_list(list)));
                Ok(len)
            }
        }
    }

    /// Removes and returns the head element.
    pub fn list_pop(&self, key: &str) -> Result<Bytes, CoreError> {
        let Some(item) = self.live(key) else {
            return Err(CoreError::NotFound);
        };
        let mut data = item.write();
        if data.kind() != Kind::List {
            return Err(CoreError::WrongType);
        }
        data.list_mut().pop().ok_or(CoreError::NotFound)
    }

    /// Remaining TTL in seconds, `-1` without a TTL, `-2` when the key is
    /// missing or expired.
    pub fn ttl(&self, key: &str) -> i64 {
        match self.live(key) {
            None => -2,
            Some(item) => {
                let data = item.read();
                if data.has_ttl() {
                    data.ttl_seconds()
                } else {
                    -1
                }
            }
        }
    }

    /// Arms a TTL on a live key; 1 on success, 0 when the key is missing
    /// or expired. A non-positive TTL deletes the key and still counts as
    /// success.
    pub fn expire(&self, key: &str, seconds: i64) -> i64 {
        let Some(item) = self.live(key) else {
            return 0;
        };
        if seconds <= 0 {
            self.storage.del(&[key.to_string()]);
            return 1;
        }
        item.write().set_ttl_seconds(seconds);
        1
    }

    /// Drops the TTL; 1 when one was removed, 0 otherwise.
    pub fn persist(&self, key: &str) -> i64 {
        let Some(item) = self.live(key) else {
            return 0;
        };
        if item.write().clear_ttl() {
            1
        } else {
            0
        }
    }

    /// Sweeps the storage for expired items in batches and removes them
    /// with a compare-and-swap delete, so a key overwritten between
    /// observation and deletion keeps its replacement. Returns how many
    /// items were removed.
    pub fn collect_expired(&self) -> usize {
        let batch_size = self.config.collect_expired_batch_size.max(1);
        let keys = self.storage.keys();

        let mut expired: HashMap<String, Arc<Item>> = HashMap::new();
        let mut total = 0;
        for chunk in keys.chunks(batch_size) {
            for (key, item) in self.storage.get_many(chunk) {
                if item.read().is_expired() {
                    expired.insert(key, item);
                }
            }
            if expired.len() > batch_size {
                total += self.storage.del_if_same(&expired);
                expired.clear();
            }
        }
        total += self.storage.del_if_same(&expired);

        total
    }

    /// Dumps the whole storage for the durability layer. Not callable
    /// concurrently with command handlers that expect stable latency; the
    /// storage holds every lock for the duration.
    pub fn dump_data<W: Write>(&self, w: &mut W, last_sequence_id: i64) -> Result<(), StorageError> {
        self.storage.persist(w, last_sequence_id)
    }

    /// Restores the storage from a snapshot stream; only valid on an empty
    /// core. Returns the last applied sequence id.
    pub fn load_data<R: Read>(&self, r: &mut R) -> Result<i64, StorageError> {
        self.storage.load(r)
    }
}
