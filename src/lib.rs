//! SID — Storage Instantiation Daemon.
//!
//! Processes kernel block-device uevents through a per-device scan pipeline
//! of pluggable classification modules, backed by a transactional,
//! versioned KV store shared between a proxy process and the short-lived
//! worker processes it forks to run each scan.
//!
//! Module map:
//!
//! - [`buffer`] — framed byte buffers (in-memory and `memfd`-backed).
//! - [`kv`] — the KV store: records, flags, and the SYNC index alias.
//! - [`keys`] — the composite key codec and namespaces.
//! - [`delta`] — the delta engine (SET/PLUS/MINUS, relation, absolute).
//! - [`context`] — the per-process common context.
//! - [`command`] — the command execution state machine.
//! - [`scan`] — the scan pipeline phase sequence.
//! - [`worker`] — worker process control.
//! - [`bridge`] — the client-facing socket and udev re-export.
//! - [`sync`] — the worker→proxy export-buffer merge protocol.
//! - [`proto`] — the request/response and internal sync wire formats.
//! - [`module`] — the block/type module callback contract.
//! - [`config`] — daemon configuration.
//! - [`error`] — the crate-wide error taxonomy.
//! - `persist` (feature `persistence`) — the `CHECKPOINT`/`DBRESTORE`
//!   on-disk snapshot format.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Wire protocol version negotiated on the bridge's listening socket.
pub const PROTOCOL_VERSION: u32 = 1;

pub mod bridge;
pub mod buffer;
pub mod command;
pub mod config;
pub mod context;
pub mod delta;
pub mod error;
pub mod keys;
pub mod kv;
pub mod module;
#[cfg(feature = "persistence")]
pub mod persist;
pub mod proto;
pub mod scan;
pub mod sync;
pub mod worker;

pub use error::{SidError, SidResult};
