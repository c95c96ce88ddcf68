//! Concierge storage crate - SQLite persistence for conversations and chunks.
//!
//! Provides a WAL-mode SQLite database with migrations, the append-only
//! conversation turn log, and the repository that persists indexed
//! document chunks with their embeddings.

pub mod chunks;
pub mod conversation;
pub mod db;
pub mod migrations;

pub use chunks::{blob_to_vec, vec_to_blob, ChunkRepository, StoredDocument};
pub use conversation::{ConversationStore, ConversationStores, DEFAULT_SEARCH_LIMIT};
pub use db::Database;
