//! SQLite-backed pending operation queue.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::{OperationKind, PendingOperation};
use crate::db::Database;
use crate::error::StoreError;

/// Raw row as stored: (id, resource, kind, payload, created_at)
type OperationRow = (String, String, String, String, i64);

fn read_row(row: &Row<'_>) -> rusqlite::Result<OperationRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_row((id, resource, kind, payload, created_at): OperationRow) -> Result<PendingOperation, StoreError> {
  let kind = kind
    .parse::<OperationKind>()
    .map_err(|e| StoreError::Transaction(format!("Corrupt operation {}: {}", id, e)))?;
  Ok(PendingOperation {
    payload: serde_json::from_str(&payload)?,
    id,
    resource,
    kind,
    created_at,
  })
}

/// Append-only journal of not-yet-applied writes.
///
/// Operations come back in the order they were enqueued. The only ways out are
/// `remove` after a successful remote apply and the administrative `clear_all`.
#[derive(Clone)]
pub struct OperationQueue {
  db: Database,
}

impl OperationQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Append a write at the tail and return its id.
  pub fn enqueue(
    &self,
    resource: &str,
    kind: OperationKind,
    payload: Value,
  ) -> Result<String, StoreError> {
    let id = Uuid::new_v4().to_string();
    let payload = serde_json::to_string(&payload)?;
    let now = Utc::now().timestamp_millis();

    let created_at = self.db.with_tx(|tx| {
      let last: Option<i64> = tx.query_row(
        "SELECT MAX(created_at) FROM pending_operations",
        [],
        |row| row.get(0),
      )?;

      // Strictly increasing even when the clock stalls or steps back
      let created_at = match last {
        Some(last) if last >= now => last + 1,
        _ => now,
      };

      tx.execute(
        "INSERT INTO pending_operations (id, resource, kind, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, resource, kind.as_str(), payload, created_at],
      )?;
      Ok(created_at)
    })?;

    debug!(id = %id, resource, %kind, created_at, "Operation enqueued");
    Ok(id)
  }

  /// All pending operations, oldest first.
  ///
  /// Each call reads the live queue, so repeated calls reflect removals.
  pub fn list_pending(&self) -> Result<Vec<PendingOperation>, StoreError> {
    let rows: Vec<OperationRow> = self.db.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT id, resource, kind, payload, created_at FROM pending_operations
         ORDER BY created_at ASC, rowid ASC",
      )?;
      let rows = stmt
        .query_map([], read_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })?;

    rows.into_iter().map(decode_row).collect()
  }

  /// Look up a single pending operation.
  pub fn get(&self, id: &str) -> Result<Option<PendingOperation>, StoreError> {
    let row: Option<OperationRow> = self.db.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT id, resource, kind, payload, created_at FROM pending_operations
             WHERE id = ?1",
            params![id],
            read_row,
          )
          .optional()?,
      )
    })?;

    row.map(decode_row).transpose()
  }

  /// Number of operations still waiting.
  pub fn pending_count(&self) -> Result<usize, StoreError> {
    let count: i64 = self.db.with_conn(|conn| {
      Ok(conn.query_row("SELECT COUNT(*) FROM pending_operations", [], |row| row.get(0))?)
    })?;
    Ok(count as usize)
  }

  /// Drop one operation. Removing an id that is already gone is a no-op.
  pub fn remove(&self, id: &str) -> Result<(), StoreError> {
    let removed = self.db.with_tx(|tx| {
      Ok(tx.execute("DELETE FROM pending_operations WHERE id = ?1", params![id])?)
    })?;

    if removed == 0 {
      debug!(id, "Operation already removed");
    }
    Ok(())
  }

  /// Discard every pending operation. Unsynced writes are lost.
  pub fn clear_all(&self) -> Result<usize, StoreError> {
    let removed = self
      .db
      .with_tx(|tx| Ok(tx.execute("DELETE FROM pending_operations", [])?))?;

    if removed > 0 {
      warn!(removed, "Discarded unsynced pending operations");
    }
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn queue() -> OperationQueue {
    OperationQueue::new(Database::open_in_memory().unwrap())
  }

  #[test]
  fn test_enqueue_then_list() {
    let queue = queue();
    let id = queue
      .enqueue("leads", OperationKind::Insert, json!({"name": "Ana"}))
      .unwrap();

    let pending = queue.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].resource, "leads");
    assert_eq!(pending[0].kind, OperationKind::Insert);
    assert_eq!(pending[0].payload, json!({"name": "Ana"}));
  }

  #[test]
  fn test_list_is_fifo_with_increasing_created_at() {
    let queue = queue();
    let a = queue.enqueue("leads", OperationKind::Insert, json!({"id": 1})).unwrap();
    let b = queue.enqueue("leads", OperationKind::Update, json!({"id": 1})).unwrap();
    let c = queue.enqueue("leads", OperationKind::Delete, json!({"id": 1})).unwrap();

    let pending = queue.list_pending().unwrap();
    let ids: Vec<&str> = pending.iter().map(|op| op.id.as_str()).collect();
    assert_eq!(ids, vec![a.as_str(), b.as_str(), c.as_str()]);
    assert!(pending.windows(2).all(|w| w[0].created_at < w[1].created_at));
  }

  #[test]
  fn test_remove_is_idempotent() {
    let queue = queue();
    let a = queue.enqueue("leads", OperationKind::Insert, json!({})).unwrap();
    let b = queue.enqueue("leads", OperationKind::Insert, json!({})).unwrap();

    queue.remove(&a).unwrap();
    let after_first = queue.list_pending().unwrap();
    queue.remove(&a).unwrap();
    let after_second = queue.list_pending().unwrap();

    assert_eq!(after_first, after_second);
    assert_eq!(after_second.len(), 1);
    assert_eq!(after_second[0].id, b);
  }

  #[test]
  fn test_list_is_restartable() {
    let queue = queue();
    queue.enqueue("galleries", OperationKind::Insert, json!({})).unwrap();

    assert_eq!(queue.list_pending().unwrap().len(), 1);
    assert_eq!(queue.list_pending().unwrap().len(), 1);
  }

  #[test]
  fn test_get_and_count() {
    let queue = queue();
    let id = queue
      .enqueue("stories", OperationKind::Delete, json!("story-7"))
      .unwrap();

    assert_eq!(queue.pending_count().unwrap(), 1);
    let op = queue.get(&id).unwrap().unwrap();
    assert_eq!(op.payload, json!("story-7"));
    assert!(queue.get("nope").unwrap().is_none());
  }

  #[test]
  fn test_clear_all() {
    let queue = queue();
    queue.enqueue("leads", OperationKind::Insert, json!({})).unwrap();
    queue.enqueue("leads", OperationKind::Insert, json!({})).unwrap();

    assert_eq!(queue.clear_all().unwrap(), 2);
    assert_eq!(queue.pending_count().unwrap(), 0);
    assert_eq!(queue.clear_all().unwrap(), 0);
  }

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    let id = {
      let queue = OperationQueue::new(Database::open(&path).unwrap());
      queue.enqueue("leads", OperationKind::Insert, json!({"name": "Ana"})).unwrap()
    };

    let queue = OperationQueue::new(Database::open(&path).unwrap());
    let pending = queue.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
  }
}
