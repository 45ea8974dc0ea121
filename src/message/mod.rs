//! Wire-neutral command and reply containers.
//!
//! Protocol adapters parse bytes into a [`Request`], the controller funnels
//! it through the processor, and the resulting [`Response`] is serialized
//! back by the adapter. Neither type knows anything about RESP or HTTP,
//! which keeps the dispatch and durability layers protocol-agnostic.

pub mod request;
pub mod response;

pub use request::{now_unix_secs, ArgError, Request};
pub use response::{Response, Status};
