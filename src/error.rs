//! Error types for the offline store, the remote contract and cached reads.

use thiserror::Error;

/// Failures raised by the persistent store and everything layered on it.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The database could not be opened at all (permissions, missing directory,
  /// read-only media). Callers should fall back to running without offline support.
  #[error("offline storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A single store operation failed. Safe to retry that operation.
  #[error("store transaction failed: {0}")]
  Transaction(String),

  /// Schema creation or migration failed, or the file was written by a newer version.
  #[error("schema upgrade failed: {0}")]
  SchemaUpgrade(String),

  /// A stored payload could not be encoded or decoded.
  #[error("failed to serialize stored payload: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl StoreError {
  /// Whether offline storage has to be switched off instead of retried.
  pub fn disables_storage(&self) -> bool {
    matches!(self, StoreError::StorageUnavailable(_) | StoreError::SchemaUpgrade(_))
  }
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::Transaction(e.to_string())
  }
}

/// A queued operation was rejected by (or never reached) the remote service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("remote apply failed: {reason}")]
pub struct RemoteApplyError {
  pub reason: String,
}

impl RemoteApplyError {
  pub fn new(reason: impl Into<String>) -> Self {
    Self {
      reason: reason.into(),
    }
  }
}

/// Failure of a write that was applied directly instead of queued.
#[derive(Debug, Error)]
pub enum WriteError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Remote(#[from] RemoteApplyError),
}

/// Failure of a cache-first read.
#[derive(Debug, Error)]
pub enum FetchError<E> {
  /// Offline and nothing cached under the key.
  #[error("offline and no cached data for '{key}'")]
  Offline { key: String },

  /// Online, the fetch failed and there was no cached fallback.
  #[error("fetch failed: {0}")]
  Remote(E),
}
