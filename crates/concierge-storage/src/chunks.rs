//! Persistence for indexed document chunks and their embeddings.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use concierge_core::error::ConciergeError;
use concierge_core::types::DocumentChunk;

use crate::db::Database;

/// One document's persisted chunk set.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub document_id: String,
    pub source: Option<String>,
    pub content_hash: String,
    /// Chunks in ordinal order.
    pub chunks: Vec<DocumentChunk>,
}

/// Repository for document chunk sets.
#[derive(Debug, Clone)]
pub struct ChunkRepository {
    db: Arc<Database>,
}

impl ChunkRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Replace a document's whole chunk set in one transaction.
    pub fn replace_document(
        &self,
        document_id: &str,
        source: Option<&str>,
        content_hash: &str,
        chunks: &[DocumentChunk],
    ) -> Result<(), ConciergeError> {
        self.db.with_conn(|conn| {
            let write = |e: rusqlite::Error| {
                ConciergeError::StorageWrite(format!(
                    "Failed to persist chunks for {}: {}",
                    document_id, e
                ))
            };

            let tx = conn.unchecked_transaction().map_err(write)?;
            tx.execute(
                "DELETE FROM chunks WHERE document_id = ?1",
                rusqlite::params![document_id],
            )
            .map_err(write)?;
            tx.execute(
                "INSERT INTO documents (id, source, content_hash, ingested_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    source = excluded.source,
                    content_hash = excluded.content_hash,
                    ingested_at = excluded.ingested_at",
                rusqlite::params![document_id, source, content_hash, Utc::now().timestamp()],
            )
            .map_err(write)?;

            {
                let mut insert = tx
                    .prepare(
                        "INSERT INTO chunks (chunk_id, document_id, ordinal, text, reference, embedding)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )
                    .map_err(write)?;
                for chunk in chunks {
                    insert
                        .execute(rusqlite::params![
                            chunk.chunk_id,
                            document_id,
                            chunk.ordinal,
                            chunk.text,
                            chunk.reference,
                            vec_to_blob(&chunk.embedding),
                        ])
                        .map_err(write)?;
                }
            }

            tx.commit().map_err(write)?;
            debug!(document_id, chunks = chunks.len(), "Persisted document chunks");
            Ok(())
        })
    }

    /// Remove a document and its chunks. Returns false if it was not stored.
    pub fn remove_document(&self, document_id: &str) -> Result<bool, ConciergeError> {
        self.db.with_conn(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM documents WHERE id = ?1",
                    rusqlite::params![document_id],
                )
                .map_err(|e| {
                    ConciergeError::StorageWrite(format!("Failed to remove document: {}", e))
                })?;
            Ok(removed > 0)
        })
    }

    /// Load every stored document with its chunks, ordered by document id.
    pub fn load_all(&self) -> Result<Vec<StoredDocument>, ConciergeError> {
        self.db.with_conn(|conn| {
            let mut documents: BTreeMap<String, StoredDocument> = BTreeMap::new();

            let mut stmt = conn
                .prepare("SELECT id, source, content_hash FROM documents")
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(StoredDocument {
                        document_id: row.get(0)?,
                        source: row.get(1)?,
                        content_hash: row.get(2)?,
                        chunks: Vec::new(),
                    })
                })
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;
            for row in rows {
                let doc = row.map_err(|e| ConciergeError::Storage(e.to_string()))?;
                documents.insert(doc.document_id.clone(), doc);
            }

            let mut stmt = conn
                .prepare(
                    "SELECT chunk_id, document_id, ordinal, text, reference, embedding
                     FROM chunks ORDER BY document_id, ordinal",
                )
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    let blob: Vec<u8> = row.get(5)?;
                    Ok(DocumentChunk {
                        chunk_id: row.get(0)?,
                        document_id: row.get(1)?,
                        ordinal: row.get(2)?,
                        text: row.get(3)?,
                        reference: row.get(4)?,
                        embedding: blob_to_vec(&blob),
                    })
                })
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;
            for row in rows {
                let chunk = row.map_err(|e| ConciergeError::Storage(e.to_string()))?;
                match documents.get_mut(&chunk.document_id) {
                    Some(doc) => doc.chunks.push(chunk),
                    None => {
                        return Err(ConciergeError::Storage(format!(
                            "Chunk {} has no document row",
                            chunk.chunk_id
                        )))
                    }
                }
            }

            Ok(documents.into_values().collect())
        })
    }

    /// Total number of stored chunks.
    pub fn count(&self) -> Result<u64, ConciergeError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;
            Ok(count.max(0) as u64)
        })
    }
}

/// Encode an embedding as little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for &value in vec {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode little-endian f32 bytes. Trailing partial values are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}
