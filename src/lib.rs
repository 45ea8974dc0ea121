//! # Radish - An In-Memory Key-Value Store with Redis Semantics
//!
//! Radish speaks the RESP protocol (plus a simple HTTP mapping) over a
//! typed in-memory store: every key holds a byte string, a list, or a
//! field dictionary, with optional per-key TTLs collected in the
//! background. An optional durability layer journals writes to a
//! write-ahead log and periodically folds it into a snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  RESP / HTTP adapter                                      │
//! │        │ Request                                          │
//! │        ▼                                                  │
//! │  Controller ──────────────► Keeper (WAL + snapshots)      │
//! │        │                                                  │
//! │        ▼                                                  │
//! │  Processor ─► Core ─► Storage (1024 buckets) ─► Item      │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`storage`]: sharded bucket map over typed, individually locked
//!   value cells
//! - [`core`]: Redis-like command semantics, TTL rules, expiry collection
//! - [`controller`]: dispatch, lifecycle, and the durability subsystem
//! - [`server`]: the RESP and HTTP byte translators
//! - [`message`]: the protocol-agnostic request/response containers
//!
//! ## Quick start
//!
//! ```no_run
//! use radish::{Config, Controller};
//!
//! #[tokio::main]
//! async fn main() {
//!     let controller = Controller::new(Config::default());
//!     controller.run().await.unwrap();
//! }
//! ```

pub mod controller;
pub mod core;
pub mod message;
pub mod server;
pub mod storage;

pub use crate::controller::{Config, Controller, Keeper, Processor, SyncPolicy};
pub use crate::core::{Core, CoreConfig, CoreError};
pub use crate::message::{Request, Response, Status};
pub use crate::storage::{Item, Kind, Storage};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 6380;

/// Default listening host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Crate version, as served by the build.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
