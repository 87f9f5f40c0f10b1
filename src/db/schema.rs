//! Versioned schema for the offline database.
//!
//! The version lives in `PRAGMA user_version`. `MIGRATIONS[i]` upgrades a
//! database from version `i` to `i + 1`.

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 2;

const V1_TABLES: &str = r#"
-- Read-through snapshots, one row per key regardless of owner
CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    owner_id TEXT NOT NULL
);

-- Write journal replayed in created_at order
CREATE TABLE IF NOT EXISTS pending_operations (
    id TEXT PRIMARY KEY,
    resource TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
"#;

const V2_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_cache_owner ON cache(owner_id);
CREATE INDEX IF NOT EXISTS idx_pending_created ON pending_operations(created_at);
"#;

const MIGRATIONS: &[&str] = &[V1_TABLES, V2_INDEXES];

/// Read the schema version recorded in the database file.
pub fn current_version(conn: &Connection) -> Result<i64, StoreError> {
  conn
    .pragma_query_value(None, "user_version", |row| row.get(0))
    .map_err(|e| StoreError::SchemaUpgrade(format!("Failed to read schema version: {}", e)))
}

/// Bring the database up to `SCHEMA_VERSION`.
///
/// All pending steps run in one transaction, so a failed upgrade leaves the
/// file at its previous version with no half-applied steps.
pub fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
  let current = current_version(conn)?;

  if current > SCHEMA_VERSION {
    return Err(StoreError::SchemaUpgrade(format!(
      "database schema v{} is newer than supported v{}",
      current, SCHEMA_VERSION
    )));
  }
  if current == SCHEMA_VERSION {
    return Ok(());
  }

  let tx = conn
    .transaction()
    .map_err(|e| StoreError::SchemaUpgrade(format!("Failed to begin migration: {}", e)))?;

  for (from, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
    tx.execute_batch(sql).map_err(|e| {
      StoreError::SchemaUpgrade(format!("Migration v{} -> v{} failed: {}", from, from + 1, e))
    })?;
  }

  tx.pragma_update(None, "user_version", SCHEMA_VERSION)
    .map_err(|e| StoreError::SchemaUpgrade(format!("Failed to record schema version: {}", e)))?;
  tx.commit()
    .map_err(|e| StoreError::SchemaUpgrade(format!("Failed to commit migration: {}", e)))?;

  info!(from = current, to = SCHEMA_VERSION, "Offline schema migrated");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn index_exists(conn: &Connection, name: &str) -> bool {
    conn
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?",
        [name],
        |row| row.get::<_, i64>(0),
      )
      .map(|n| n == 1)
      .unwrap_or(false)
  }

  #[test]
  fn test_fresh_database_gets_current_version() {
    let mut conn = Connection::open_in_memory().unwrap();
    migrate(&mut conn).unwrap();

    assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);
    assert!(index_exists(&conn, "idx_cache_owner"));
    assert!(index_exists(&conn, "idx_pending_created"));
  }

  #[test]
  fn test_migrate_is_idempotent() {
    let mut conn = Connection::open_in_memory().unwrap();
    migrate(&mut conn).unwrap();
    migrate(&mut conn).unwrap();
    assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);
  }

  #[test]
  fn test_upgrade_from_v1_preserves_rows() {
    let mut conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(V1_TABLES).unwrap();
    conn.pragma_update(None, "user_version", 1).unwrap();
    conn
      .execute(
        "INSERT INTO cache (key, data, timestamp, owner_id) VALUES ('leads:p1', '[]', 1, 'p1')",
        [],
      )
      .unwrap();

    migrate(&mut conn).unwrap();

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))
      .unwrap();
    assert_eq!(count, 1);
    assert!(index_exists(&conn, "idx_cache_owner"));
    assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);
  }

  #[test]
  fn test_newer_schema_is_refused() {
    let mut conn = Connection::open_in_memory().unwrap();
    conn
      .pragma_update(None, "user_version", SCHEMA_VERSION + 1)
      .unwrap();

    let err = migrate(&mut conn).unwrap_err();
    assert!(matches!(err, StoreError::SchemaUpgrade(_)));
  }
}
