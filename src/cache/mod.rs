//! Read-through cache for offline support.
//!
//! This module provides a tenant-aware caching mechanism that:
//! - Stores keyed snapshots of read results with their write time and owner
//! - Evicts per key or per owner (tenant switch, logout)
//! - Serves cached snapshots when the network is unavailable
//! - Leaves staleness policy to the caller via a configurable fresh window

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, NoopCache, SqliteCache};
pub use traits::{CacheEntry, CacheResult, CacheSource, QueryKey};
