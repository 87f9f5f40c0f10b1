pub mod schema;

use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::error::StoreError;

/// Handle to the offline database.
///
/// Cloning is cheap and every clone shares one connection. Each logical
/// operation runs in its own transaction under the connection lock, so callers
/// never observe partial writes.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open or create the database at the default location
  pub fn open_default() -> Result<Self, StoreError> {
    let path = Self::default_path()?;
    Self::open(&path)
  }

  /// Open or create the database at `path`, migrating it to the current schema.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::StorageUnavailable(format!(
          "Failed to create database directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::StorageUnavailable(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    conn
      .execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
      .map_err(|e| StoreError::StorageUnavailable(format!("Failed to configure database: {}", e)))?;

    debug!(path = %path.display(), "Opened offline database");
    Self::from_connection(conn)
  }

  /// Open a private in-memory database. Nothing survives the handle.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StoreError::StorageUnavailable(format!("Failed to open in-memory database: {}", e)))?;
    Self::from_connection(conn)
  }

  fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
    // Migration finishes before the handle exists, so no caller sees a
    // half-upgraded schema.
    schema::migrate(&mut conn)?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::StorageUnavailable("Could not determine data directory".into()))?;

    Ok(data_dir.join("offsync").join("offline.db"))
  }

  /// Schema version recorded in the file.
  pub fn schema_version(&self) -> Result<i64, StoreError> {
    self.with_conn(|conn| schema::current_version(conn))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Transaction(format!("Lock poisoned: {}", e)))
  }

  /// Run a read against the connection.
  pub(crate) fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
  where
    F: FnOnce(&Connection) -> Result<T, StoreError>,
  {
    let conn = self.lock()?;
    f(&conn)
  }

  /// Run `f` inside a transaction. An error from `f` rolls everything back.
  pub(crate) fn with_tx<T, F>(&self, f: F) -> Result<T, StoreError>
  where
    F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
  {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
  }
}
