//! Offline-aware client that wires the store, cache, queue and sync together.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheLayer, CacheResult, CacheStorage, NoopCache, SqliteCache};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::db::Database;
use crate::error::{FetchError, StoreError, WriteError};
use crate::queue::{OperationKind, OperationQueue, PendingOperation};
use crate::sync::{
  spawn_auto_sync, RemoteService, RetryPolicy, SyncCoordinator, SyncReport, SyncStatus,
};

/// Where a write ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
  /// Applied to the remote service immediately
  Applied,
  /// Stored in the pending queue under this id
  Queued(String),
}

/// What a session reset removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCleared {
  pub evicted_entries: usize,
  pub discarded_operations: usize,
}

/// The surface data-fetching and write-intent callers use.
///
/// Reads go through the cache layer, writes go to the remote when that is
/// safe and to the pending queue otherwise.
#[derive(Clone)]
pub struct OfflineClient<S: CacheStorage = SqliteCache> {
  cache: CacheLayer<S>,
  queue: OperationQueue,
  connectivity: ConnectivityMonitor,
  sync: SyncCoordinator,
}

impl OfflineClient<SqliteCache> {
  /// Build a client over an already opened database.
  pub fn from_parts(
    db: Database,
    remote: Arc<dyn RemoteService>,
    connectivity: ConnectivityMonitor,
  ) -> Self {
    let cache = CacheLayer::new(SqliteCache::new(db.clone()), connectivity.clone());
    Self::assemble(cache, OperationQueue::new(db), remote, connectivity)
  }

  /// Open the configured database and build a client on it.
  pub fn open(
    config: &Config,
    remote: Arc<dyn RemoteService>,
    connectivity: ConnectivityMonitor,
  ) -> Result<Self, StoreError> {
    let db = match &config.database_path {
      Some(path) => Database::open(path)?,
      None => Database::open_default()?,
    };

    let client = Self::from_parts(db, remote, connectivity);
    Ok(client.with_stale_time(config.cache.stale_time()))
  }
}

impl OfflineClient<NoopCache> {
  /// Degraded client for when the database cannot be opened.
  ///
  /// Reads always go to the network. Writes made while offline are still
  /// ordered but only held in memory, so they are lost when the process exits.
  pub fn without_storage(
    remote: Arc<dyn RemoteService>,
    connectivity: ConnectivityMonitor,
  ) -> Result<Self, StoreError> {
    warn!("Running without persistent offline storage");
    let cache = CacheLayer::new(NoopCache, connectivity.clone());
    let queue = OperationQueue::new(Database::open_in_memory()?);
    Ok(Self::assemble(cache, queue, remote, connectivity))
  }
}

impl<S: CacheStorage> OfflineClient<S> {
  fn assemble(
    cache: CacheLayer<S>,
    queue: OperationQueue,
    remote: Arc<dyn RemoteService>,
    connectivity: ConnectivityMonitor,
  ) -> Self {
    let sync = SyncCoordinator::new(queue.clone(), remote);
    Self {
      cache,
      queue,
      connectivity,
      sync,
    }
  }

  pub fn with_stale_time(mut self, stale_time: chrono::Duration) -> Self {
    self.cache = self.cache.with_stale_time(stale_time);
    self
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.connectivity
  }

  pub fn coordinator(&self) -> &SyncCoordinator {
    &self.sync
  }

  // ===== Cache =====

  pub fn get_cache<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, StoreError> {
    self.cache.storage().get_cache(key)
  }

  pub fn set_cache<T: Serialize>(&self, key: &str, data: &T, owner_id: &str) -> Result<(), StoreError> {
    self.cache.storage().set_cache(key, data, owner_id)
  }

  pub fn remove_cache(&self, key: &str) -> Result<(), StoreError> {
    self.cache.storage().remove_cache(key)
  }

  pub fn clear_cache_for_profile(&self, owner_id: &str) -> Result<usize, StoreError> {
    self.cache.storage().clear_cache_for_profile(owner_id)
  }

  /// Cache-first read, see [`CacheLayer::fetch`].
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
    self.cache.fetch(key, owner_id, fetcher).await
  }

  // ===== Pending operations =====

  /// Defer a write: always queue it, whatever the connectivity.
  pub fn enqueue(
    &self,
    resource: &str,
    kind: OperationKind,
    payload: Value,
  ) -> Result<String, StoreError> {
    let id = self.queue.enqueue(resource, kind, payload)?;
    self.sync.refresh_pending_count()?;
    Ok(id)
  }

  pub fn list_pending(&self) -> Result<Vec<PendingOperation>, StoreError> {
    self.queue.list_pending()
  }

  pub fn remove(&self, operation_id: &str) -> Result<(), StoreError> {
    self.queue.remove(operation_id)?;
    self.sync.refresh_pending_count()?;
    Ok(())
  }

  /// Discard every unsynced write. Only call this at an explicit session boundary.
  pub fn clear_all(&self) -> Result<usize, StoreError> {
    let removed = self.queue.clear_all()?;
    self.sync.refresh_pending_count()?;
    Ok(removed)
  }

  /// Apply a write now if that cannot reorder it, otherwise queue it.
  ///
  /// Direct application needs the client to be online with nothing queued and
  /// no drain running; anything else would let this write overtake older ones.
  /// Concurrent writes are safe: only one can hold the drain slot, the others
  /// are queued behind it and replayed once it finishes.
  pub async fn write(
    &self,
    resource: &str,
    kind: OperationKind,
    payload: Value,
  ) -> Result<WriteOutcome, WriteError> {
    let online = self.connectivity.is_online();

    if online && self.sync.apply_if_idle(resource, kind, &payload).await? {
      debug!(resource, %kind, "Write applied directly");
      // Writes queued while the slot was held were held back by it
      if self.queue.pending_count()? > 0 {
        self.spawn_sync();
      }
      return Ok(WriteOutcome::Applied);
    }

    let id = self.enqueue(resource, kind, payload)?;
    debug!(resource, %kind, id = %id, online, "Write queued");

    if online {
      self.spawn_sync();
    }

    Ok(WriteOutcome::Queued(id))
  }

  fn spawn_sync(&self) {
    let sync = self.sync.clone();
    tokio::spawn(async move {
      if let Err(e) = sync.request_sync().await {
        warn!(error = %e, "Sync after queued write failed");
      }
    });
  }

  // ===== Sync =====

  /// Manual "sync now".
  pub async fn sync_now(&self) -> Result<SyncReport, StoreError> {
    self.sync.request_sync().await
  }

  /// Start draining automatically on reconnect, see [`spawn_auto_sync`].
  pub fn spawn_auto_sync(&self, policy: RetryPolicy) -> JoinHandle<()> {
    spawn_auto_sync(self.sync.clone(), self.connectivity.clone(), policy)
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  pub fn is_syncing(&self) -> bool {
    self.sync.is_syncing()
  }

  pub fn pending_count(&self) -> usize {
    self.sync.pending_count()
  }

  pub fn sync_status(&self) -> SyncStatus {
    self.sync.status()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
    self.sync.subscribe()
  }

  // ===== Session =====

  /// Tenant switch or logout: evict the owner's cached reads.
  ///
  /// Pending writes are kept unless `discard_pending` is set, since dropping
  /// them loses data the user has not synced yet.
  pub fn clear_session(&self, owner_id: &str, discard_pending: bool) -> Result<SessionCleared, StoreError> {
    let evicted_entries = self.clear_cache_for_profile(owner_id)?;
    let discarded_operations = if discard_pending { self.clear_all()? } else { 0 };

    info!(owner_id, evicted_entries, discarded_operations, "Session cleared");
    Ok(SessionCleared {
      evicted_entries,
      discarded_operations,
    })
  }
}
