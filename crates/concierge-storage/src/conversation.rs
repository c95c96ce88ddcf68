//! Durable, append-only conversation turn log.
//!
//! `ConversationStores` is the registry of conversations sharing one
//! database. `ConversationStore` is a handle on a single conversation; it
//! assigns turn ids, persists turns write-through and serves the recent
//! window used as classifier context.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

use concierge_core::error::ConciergeError;
use concierge_core::types::{ConversationSummary, NewTurn, Role, TaskLabel, Turn, TurnMatch};

use crate::db::Database;

/// Maximum number of hits returned by `search` when the caller has no preference.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

const APPEND_ATTEMPTS: u32 = 2;
const APPEND_BACKOFF: Duration = Duration::from_millis(50);

const TURN_COLUMNS: &str = "turn_id, timestamp, role, text, task_label, metadata";

/// Registry of all conversations stored in one database.
#[derive(Debug, Clone)]
pub struct ConversationStores {
    db: Arc<Database>,
}

impl ConversationStores {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open a conversation, creating it on first reference.
    pub fn open(&self, id: &str) -> Result<ConversationStore, ConciergeError> {
        self.open_for_user(id, None)
    }

    /// Open a conversation owned by `user_id`, creating it on first reference.
    ///
    /// The owner is only recorded at creation; reopening never reassigns it.
    pub fn open_for_user(
        &self,
        id: &str,
        user_id: Option<&str>,
    ) -> Result<ConversationStore, ConciergeError> {
        if id.trim().is_empty() {
            return Err(ConciergeError::Config(
                "conversation id must not be empty".to_string(),
            ));
        }

        let created = self.db.with_conn(|conn| {
            let now = Utc::now().timestamp_millis();
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO conversations (id, user_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)",
                    rusqlite::params![id, user_id, now],
                )
                .map_err(|e| {
                    ConciergeError::StorageWrite(format!("Failed to create conversation: {}", e))
                })?;
            Ok(inserted > 0)
        })?;

        if created {
            info!(conversation_id = id, "Created conversation");
        }

        Ok(ConversationStore {
            db: Arc::clone(&self.db),
            id: id.to_string(),
        })
    }

    /// Create a conversation with a fresh random id.
    pub fn create(&self, user_id: Option<&str>) -> Result<ConversationStore, ConciergeError> {
        let id = Uuid::new_v4().to_string();
        self.open_for_user(&id, user_id)
    }

    /// Load an existing conversation.
    pub fn load(&self, id: &str) -> Result<ConversationStore, ConciergeError> {
        if !self.exists(id)? {
            return Err(ConciergeError::NotFound(format!("conversation {}", id)));
        }
        Ok(ConversationStore {
            db: Arc::clone(&self.db),
            id: id.to_string(),
        })
    }

    pub fn exists(&self, id: &str) -> Result<bool, ConciergeError> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM conversations WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;
            Ok(found.is_some())
        })
    }

    /// Delete a conversation and all of its turns.
    pub fn delete(&self, id: &str) -> Result<(), ConciergeError> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM conversations WHERE id = ?1",
                rusqlite::params![id],
            )
            .map_err(|e| {
                ConciergeError::StorageWrite(format!("Failed to delete conversation: {}", e))
            })
        })?;

        if removed == 0 {
            return Err(ConciergeError::NotFound(format!("conversation {}", id)));
        }
        info!(conversation_id = id, "Deleted conversation");
        Ok(())
    }

    /// All conversations, most recently updated first.
    pub fn list(&self) -> Result<Vec<ConversationSummary>, ConciergeError> {
        self.query_summaries(None)
    }

    /// Conversations owned by `user_id`, most recently updated first.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<ConversationSummary>, ConciergeError> {
        self.query_summaries(Some(user_id))
    }

    fn query_summaries(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<ConversationSummary>, ConciergeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT c.id, c.user_id, c.created_at, c.updated_at,
                            (SELECT COUNT(*) FROM turns t WHERE t.conversation_id = c.id)
                     FROM conversations c
                     WHERE ?1 IS NULL OR c.user_id = ?1
                     ORDER BY c.updated_at DESC, c.rowid DESC",
                )
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params![user_id], |row| {
                    let created_at: i64 = row.get(2)?;
                    let updated_at: i64 = row.get(3)?;
                    let turn_count: i64 = row.get(4)?;
                    Ok(ConversationSummary {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        created_at: millis_to_datetime(created_at),
                        updated_at: millis_to_datetime(updated_at),
                        turn_count: turn_count.max(0) as u64,
                    })
                })
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConciergeError::Storage(e.to_string()))
        })
    }

    /// Case-insensitive substring search over turn text and recorded queries,
    /// newest first.
    pub fn search(&self, text: &str, limit: usize) -> Result<Vec<TurnMatch>, ConciergeError> {
        let needle = text.trim();
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let pattern = format!("%{}%", escape_like(&needle.to_lowercase()));

        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT conversation_id, turn_id, timestamp, role, text, task_label, metadata
                     FROM turns
                     WHERE lower(text) LIKE ?1 ESCAPE '\\'
                        OR lower(COALESCE(json_extract(metadata, '$.query'), '')) LIKE ?1 ESCAPE '\\'
                     ORDER BY timestamp DESC, rowid DESC
                     LIMIT ?2",
                )
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params![pattern, limit as i64], |row| {
                    let conversation_id: String = row.get(0)?;
                    let raw = RawTurn::from_row(row, 1)?;
                    Ok((conversation_id, raw))
                })
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;

            let mut matches = Vec::new();
            for row in rows {
                let (conversation_id, raw) =
                    row.map_err(|e| ConciergeError::Storage(e.to_string()))?;
                matches.push(TurnMatch {
                    conversation_id,
                    turn: raw.into_turn()?,
                });
            }
            debug!(query = needle, hits = matches.len(), "Searched conversations");
            Ok(matches)
        })
    }
}

/// Handle on one conversation's turn log.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    db: Arc<Database>,
    id: String,
}

impl ConversationStore {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append a turn and return its id.
    ///
    /// Id assignment, the insert and the conversation's `updated_at` bump
    /// commit in one transaction. A busy database is retried once.
    ///
    /// Blocking: besides the SQLite write, the retry sleeps the calling
    /// thread. Async callers should run it under `spawn_blocking`.
    pub fn append(&self, turn: NewTurn) -> Result<u64, ConciergeError> {
        let metadata = serde_json::to_string(&turn.metadata)?;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = self
                .db
                .with_conn(|conn| Ok(insert_turn(conn, &self.id, &turn, &metadata)))?;

            match outcome {
                Ok(turn_id) => {
                    debug!(
                        conversation_id = %self.id,
                        turn_id,
                        role = turn.role.as_str(),
                        "Appended turn"
                    );
                    return Ok(turn_id);
                }
                Err(e) if is_busy(&e) && attempt < APPEND_ATTEMPTS => {
                    warn!(conversation_id = %self.id, error = %e, "Database busy, retrying append");
                    std::thread::sleep(APPEND_BACKOFF);
                }
                Err(e) => {
                    return Err(ConciergeError::StorageWrite(format!(
                        "Failed to append turn to {}: {}",
                        self.id, e
                    )));
                }
            }
        }
    }

    /// The last `n` turns in chronological order.
    pub fn recent(&self, n: usize) -> Result<Vec<Turn>, ConciergeError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.tail(Some(n))
    }

    /// Turn history in chronological order, capped to the last `limit` turns.
    pub fn history(&self, limit: Option<usize>) -> Result<Vec<Turn>, ConciergeError> {
        self.tail(limit)
    }

    /// Number of turns recorded so far.
    pub fn len(&self) -> Result<u64, ConciergeError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM turns WHERE conversation_id = ?1",
                    rusqlite::params![self.id],
                    |row| row.get(0),
                )
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;
            Ok(count.max(0) as u64)
        })
    }

    pub fn is_empty(&self) -> Result<bool, ConciergeError> {
        Ok(self.len()? == 0)
    }

    fn tail(&self, limit: Option<usize>) -> Result<Vec<Turn>, ConciergeError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(|n| n as i64).unwrap_or(-1);

        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM turns WHERE conversation_id = ?1
                     ORDER BY turn_id DESC LIMIT ?2",
                    TURN_COLUMNS
                ))
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params![self.id, limit], |row| {
                    RawTurn::from_row(row, 0)
                })
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;

            let mut turns = Vec::new();
            for row in rows {
                let raw = row.map_err(|e| ConciergeError::Storage(e.to_string()))?;
                turns.push(raw.into_turn()?);
            }
            turns.reverse();
            Ok(turns)
        })
    }
}

fn insert_turn(
    conn: &Connection,
    conversation_id: &str,
    turn: &NewTurn,
    metadata: &str,
) -> Result<u64, rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;
    let now = Utc::now().timestamp_millis();

    let next_id: i64 = tx.query_row(
        "SELECT COALESCE(MAX(turn_id), 0) + 1 FROM turns WHERE conversation_id = ?1",
        rusqlite::params![conversation_id],
        |row| row.get(0),
    )?;

    tx.execute(
        "INSERT INTO turns (conversation_id, turn_id, timestamp, role, text, task_label, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            conversation_id,
            next_id,
            now,
            turn.role.as_str(),
            turn.text,
            turn.task_label.map(|label| label.as_str()),
            metadata,
        ],
    )?;

    tx.execute(
        "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
        rusqlite::params![conversation_id, now],
    )?;

    tx.commit()?;
    Ok(next_id as u64)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

// ============================================================================
// Row conversion.
// ============================================================================

/// Column values as stored, before domain validation.
struct RawTurn {
    turn_id: i64,
    timestamp: i64,
    role: String,
    text: String,
    task_label: Option<String>,
    metadata: String,
}

impl RawTurn {
    fn from_row(row: &rusqlite::Row<'_>, offset: usize) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            turn_id: row.get(offset)?,
            timestamp: row.get(offset + 1)?,
            role: row.get(offset + 2)?,
            text: row.get(offset + 3)?,
            task_label: row.get(offset + 4)?,
            metadata: row.get(offset + 5)?,
        })
    }

    fn into_turn(self) -> Result<Turn, ConciergeError> {
        let role = Role::parse(&self.role)
            .ok_or_else(|| ConciergeError::Storage(format!("Invalid role: {}", self.role)))?;
        let task_label = match self.task_label.as_deref() {
            Some(raw) => Some(
                TaskLabel::parse(raw)
                    .ok_or_else(|| ConciergeError::Storage(format!("Invalid task label: {}", raw)))?,
            ),
            None => None,
        };

        Ok(Turn {
            turn_id: self.turn_id.max(0) as u64,
            timestamp: millis_to_datetime(self.timestamp),
            role,
            text: self.text,
            task_label,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}
