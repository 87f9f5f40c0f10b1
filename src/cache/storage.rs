//! Cache storage trait and SQLite implementation.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::traits::CacheEntry;
use crate::db::Database;
use crate::error::StoreError;

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Upsert the entry under `key`, stamped with the current time.
  fn set_cache<T: Serialize>(&self, key: &str, data: &T, owner_id: &str) -> Result<(), StoreError>;

  /// Get the entry under `key`, or `None` on a miss. Never evicts.
  fn get_cache<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, StoreError>;

  /// Delete a single entry. Missing keys are ignored.
  fn remove_cache(&self, key: &str) -> Result<(), StoreError>;

  /// Delete every entry owned by `owner_id`, returning how many were removed.
  fn clear_cache_for_profile(&self, owner_id: &str) -> Result<usize, StoreError>;
}

/// Storage implementation that doesn't cache anything.
/// Used when the database is unavailable - all operations are no-ops.
#[derive(Clone, Copy, Default)]
pub struct NoopCache;

impl CacheStorage for NoopCache {
  fn set_cache<T: Serialize>(&self, _key: &str, _data: &T, _owner_id: &str) -> Result<(), StoreError> {
    Ok(()) // Discard
  }

  fn get_cache<T: DeserializeOwned>(&self, _key: &str) -> Result<Option<CacheEntry<T>>, StoreError> {
    Ok(None) // Always miss
  }

  fn remove_cache(&self, _key: &str) -> Result<(), StoreError> {
    Ok(())
  }

  fn clear_cache_for_profile(&self, _owner_id: &str) -> Result<usize, StoreError> {
    Ok(0)
  }
}

/// SQLite-backed cache over the shared offline database.
#[derive(Clone)]
pub struct SqliteCache {
  db: Database,
}

impl SqliteCache {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteCache {
  fn set_cache<T: Serialize>(&self, key: &str, data: &T, owner_id: &str) -> Result<(), StoreError> {
    let data = serde_json::to_string(data)?;
    let timestamp = Utc::now().timestamp_millis();

    self.db.with_tx(|tx| {
      tx.execute(
        "INSERT INTO cache (key, data, timestamp, owner_id) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
           data = excluded.data,
           timestamp = excluded.timestamp,
           owner_id = excluded.owner_id",
        params![key, data, timestamp, owner_id],
      )?;
      Ok(())
    })?;

    debug!(key, owner_id, "Cache entry stored");
    Ok(())
  }

  fn get_cache<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, StoreError> {
    let row: Option<(String, i64, String)> = self.db.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT data, timestamp, owner_id FROM cache WHERE key = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
          )
          .optional()?,
      )
    })?;

    match row {
      Some((data, timestamp, owner_id)) => Ok(Some(CacheEntry {
        key: key.to_string(),
        data: serde_json::from_str(&data)?,
        timestamp,
        owner_id,
      })),
      None => Ok(None),
    }
  }

  fn remove_cache(&self, key: &str) -> Result<(), StoreError> {
    self.db.with_tx(|tx| {
      tx.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
      Ok(())
    })
  }

  fn clear_cache_for_profile(&self, owner_id: &str) -> Result<usize, StoreError> {
    let removed = self.db.with_tx(|tx| {
      Ok(tx.execute("DELETE FROM cache WHERE owner_id = ?1", params![owner_id])?)
    })?;

    debug!(owner_id, removed, "Cleared cache for profile");
    Ok(removed)
  }
}
