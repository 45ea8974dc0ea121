//! Protocol front ends.
//!
//! Both adapters are pure byte translators: they parse a wire request
//! into a [`crate::message::Request`], hand it to the controller, and
//! serialize the [`crate::message::Response`] back out. All command
//! semantics live below the controller; nothing here touches the storage.

pub mod http;
pub mod resp;

pub use resp::{encode_response, parse_command, ParseError, MAX_BULK_SIZE};
