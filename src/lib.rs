//! Offline resilience core: a read-through cache and a write outbox.
//!
//! Reads are cached per key in a local SQLite database and served from there
//! while the network is down. Writes issued offline are journaled and replayed
//! in enqueue order once connectivity returns, stopping at the first write the
//! remote service rejects.

pub mod cache;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod queue;
pub mod sync;

pub use client::{OfflineClient, SessionCleared, WriteOutcome};
pub use error::{FetchError, RemoteApplyError, StoreError, WriteError};
