//! Cache layer that orchestrates caching logic with network fetching.

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CacheEntry, CacheResult};
use crate::connectivity::ConnectivityMonitor;
use crate::error::FetchError;

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the data-fetching callers and the remote service,
/// serving cached snapshots while offline and refreshing them while online.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  connectivity: ConnectivityMonitor,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S, connectivity: ConnectivityMonitor) -> Self {
    Self {
      storage: Arc::new(storage),
      connectivity,
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Read the entry, treating storage failures as a miss.
  fn read_cached<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    match self.storage.get_cache(key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "Cache read failed, treating as miss");
        None
      }
    }
  }

  fn write_cached<T: Serialize>(&self, key: &str, data: &T, owner_id: &str) {
    if let Err(e) = self.storage.set_cache(key, data, owner_id) {
      warn!(key, error = %e, "Cache write failed");
    }
  }

  /// Fetch with a cache-first strategy.
  ///
  /// 1. Offline: return the cached snapshot as-is, whatever its age
  /// 2. Online and fresh: return the cached snapshot
  /// 3. Online and stale/missing: fetch from network and update the cache
  /// 4. On network failure, return stale cache if there is one
  pub async fn fetch<T, E, F, Fut>(
    &self,
    key: &str,
    owner_id: &str,
    fetcher: F,
  ) -> Result<CacheResult<T>, FetchError<E>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let cached = self.read_cached::<T>(key);

    if !self.connectivity.is_online() {
      return match cached {
        Some(entry) => {
          let cached_at = entry.cached_at();
          Ok(CacheResult::offline(entry.data, cached_at))
        }
        None => Err(FetchError::Offline {
          key: key.to_string(),
        }),
      };
    }

    match cached {
      Some(entry) if entry.is_fresh(self.stale_time) => {
        debug!(key, "Serving fresh cache entry");
        let cached_at = entry.cached_at();
        Ok(CacheResult::from_cache(entry.data, cached_at))
      }
      cached => match fetcher().await {
        Ok(data) => {
          self.write_cached(key, &data, owner_id);
          Ok(CacheResult::from_network(data))
        }
        Err(e) => match cached {
          // Network failed, return stale cache (offline mode)
          Some(entry) => {
            let cached_at = entry.cached_at();
            Ok(CacheResult::offline(entry.data, cached_at))
          }
          None => Err(FetchError::Remote(e)),
        },
      },
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      connectivity: self.connectivity.clone(),
      stale_time: self.stale_time,
    }
  }
}
