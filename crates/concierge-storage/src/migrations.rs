//! Database schema migrations.
//!
//! Applies the initial schema: conversations, turns, documents, chunks and
//! the schema_migrations tracking table.

use rusqlite::Connection;
use tracing::info;

use concierge_core::error::ConciergeError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), ConciergeError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| ConciergeError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| ConciergeError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), ConciergeError> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY NOT NULL,
            user_id         TEXT,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations(user_id, updated_at DESC);

        -- Append-only turn log. Timestamps are Unix milliseconds.
        CREATE TABLE IF NOT EXISTS turns (
            conversation_id TEXT NOT NULL
                            REFERENCES conversations(id) ON DELETE CASCADE,
            turn_id         INTEGER NOT NULL,
            timestamp       INTEGER NOT NULL,
            role            TEXT NOT NULL CHECK (role IN ('user', 'system')),
            text            TEXT NOT NULL,
            task_label      TEXT,
            metadata        TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (conversation_id, turn_id)
        );

        CREATE INDEX IF NOT EXISTS idx_turns_timestamp ON turns(timestamp DESC);

        CREATE TABLE IF NOT EXISTS documents (
            id              TEXT PRIMARY KEY NOT NULL,
            source          TEXT,
            content_hash    TEXT NOT NULL,
            ingested_at     INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id        TEXT PRIMARY KEY NOT NULL,
            document_id     TEXT NOT NULL
                            REFERENCES documents(id) ON DELETE CASCADE,
            ordinal         INTEGER NOT NULL,
            text            TEXT NOT NULL,
            reference       TEXT,
            embedding       BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id, ordinal);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'initial_schema');

        COMMIT;
        ",
    )
    .map_err(|e| ConciergeError::Storage(format!("Migration v1 failed: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_role_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO conversations (id, created_at, updated_at) VALUES ('c', 0, 0)",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO turns (conversation_id, turn_id, timestamp, role, text)
             VALUES ('c', 1, 0, 'assistant', 'hi')",
            [],
        );
        assert!(result.is_err());
    }
}
