//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and write-through PRAGMAs on initialization.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use concierge_core::error::ConciergeError;

use crate::migrations;

/// Milliseconds SQLite waits on a locked database before reporting busy.
const BUSY_TIMEOUT_MS: u32 = 1000;

/// Thread-safe SQLite database wrapper.
///
/// `synchronous = FULL` makes every committed transaction durable before
/// the call returns. The connection is wrapped in a Mutex since rusqlite
/// Connection is not Sync.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, ConciergeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| ConciergeError::Storage(format!("Failed to open database: {}", e)))?;

        configure(&conn)?;
        info!("Database opened at {}", path.display());

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, ConciergeError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            ConciergeError::Storage(format!("Failed to open in-memory db: {}", e))
        })?;

        configure(&conn)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure, so everything the
    /// closure does is serialized against every other database call.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ConciergeError>
    where
        F: FnOnce(&Connection) -> Result<T, ConciergeError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConciergeError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }
}

fn configure(conn: &Connection) -> Result<(), ConciergeError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;",
    )
    .map_err(|e| ConciergeError::Storage(format!("Failed to set pragmas: {}", e)))?;
    conn.busy_timeout(std::time::Duration::from_millis(u64::from(BUSY_TIMEOUT_MS)))
        .map_err(|e| ConciergeError::Storage(format!("Failed to set busy timeout: {}", e)))?;
    Ok(())
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_rows(db: &Database, table: &str) -> i64 {
        db.with_conn(|conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .map_err(|e| ConciergeError::Storage(e.to_string()))
        })
        .unwrap()
    }

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        assert_eq!(count_rows(&db, "conversations"), 0);
        assert_eq!(count_rows(&db, "turns"), 0);
        assert_eq!(count_rows(&db, "chunks"), 0);
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");
        let db = Database::new(&path).unwrap();
        assert_eq!(count_rows(&db, "turns"), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_synchronous_full() {
        let db = Database::in_memory().unwrap();
        let level: i64 = db
            .with_conn(|conn| {
                conn.query_row("PRAGMA synchronous", [], |row| row.get(0))
                    .map_err(|e| ConciergeError::Storage(e.to_string()))
            })
            .unwrap();
        // 2 == FULL
        assert_eq!(level, 2);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        drop(Database::new(&path).unwrap());
        let db = Database::new(&path).unwrap();
        assert_eq!(count_rows(&db, "schema_migrations"), 1);
    }
}
