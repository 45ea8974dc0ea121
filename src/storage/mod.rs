//! Typed storage: discriminated value cells in a sharded concurrent map.
//!
//! [`Item`] is the leaf value cell (byte string, list, or dictionary, with
//! an optional TTL and its own lock). [`Storage`] spreads item handles
//! over 1024 independently locked buckets and supplies the CAS-style bulk
//! delete the expiry collector relies on, plus whole-store snapshot I/O.

pub mod item;
pub mod shard;

pub use item::{Item, ItemData, Kind, Value};
pub use shard::{Storage, StorageError, BUCKET_COUNT};
