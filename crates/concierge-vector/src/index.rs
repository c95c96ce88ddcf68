//! In-memory document index with brute-force cosine similarity search.
//!
//! Chunk sets are swapped per document under a write lock, so a reader
//! sees either the complete old revision or the complete new one. Ingests
//! of the same document are serialized by a per-document async lock while
//! distinct documents embed in parallel. Embedding happens before the
//! write lock is taken, so queries are never blocked by it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use concierge_core::error::ConciergeError;
use concierge_core::locks::KeyedLocks;
use concierge_core::types::{Document, DocumentChunk, RetrievalResult, ScoredChunk};
use concierge_storage::ChunkRepository;

use crate::chunker::{chunk_document, content_hash, ChunkingPolicy};
use crate::embedding::{cosine_similarity, DynEmbeddingService};
use crate::error::VectorError;

const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// One document's current revision.
#[derive(Debug, Clone)]
struct IndexedDocument {
    content_hash: String,
    chunks: Vec<DocumentChunk>,
}

/// Retrieval index over chunked, embedded documents.
pub struct DocumentIndex {
    embedder: Arc<dyn DynEmbeddingService>,
    policy: ChunkingPolicy,
    embed_timeout: Duration,
    documents: RwLock<BTreeMap<String, IndexedDocument>>,
    ingest_locks: KeyedLocks,
    repository: Option<ChunkRepository>,
}

impl DocumentIndex {
    /// Create an empty, memory-only index.
    pub fn new(embedder: Arc<dyn DynEmbeddingService>, policy: ChunkingPolicy) -> Self {
        Self {
            embedder,
            policy,
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
            documents: RwLock::new(BTreeMap::new()),
            ingest_locks: KeyedLocks::new(),
            repository: None,
        }
    }

    /// Bound every embedding call by `timeout`.
    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    /// Open an index backed by `repository`, loading every persisted document.
    ///
    /// Documents whose stored vectors do not match the embedder's
    /// dimensionality are skipped; they are re-embedded on their next ingest.
    pub fn load(
        embedder: Arc<dyn DynEmbeddingService>,
        policy: ChunkingPolicy,
        repository: ChunkRepository,
    ) -> Result<Self, VectorError> {
        let dimensions = embedder.dimensions();
        let mut documents = BTreeMap::new();

        for stored in repository.load_all()? {
            if stored
                .chunks
                .iter()
                .any(|chunk| chunk.embedding.len() != dimensions)
            {
                warn!(
                    document_id = %stored.document_id,
                    expected = dimensions,
                    "Skipping persisted document with mismatched embedding dimensions"
                );
                continue;
            }
            documents.insert(
                stored.document_id,
                IndexedDocument {
                    content_hash: stored.content_hash,
                    chunks: stored.chunks,
                },
            );
        }

        info!(documents = documents.len(), "Loaded document index");

        let mut index = Self::new(embedder, policy);
        index.documents = RwLock::new(documents);
        index.repository = Some(repository);
        Ok(index)
    }

    /// Chunk, embed and index a document, replacing any earlier revision.
    ///
    /// Returns the ids of the document's chunks. Re-ingesting unchanged
    /// content returns the existing ids without embedding anything.
    pub async fn ingest(&self, document: Document) -> Result<BTreeSet<String>, VectorError> {
        validate_document_id(&document.id)?;
        if document.is_blank() {
            return Err(VectorError::InvalidDocument(format!(
                "document {} has no text",
                document.id
            )));
        }

        let hash = content_hash(&document);
        let _guard = self.ingest_locks.lock(&document.id).await;

        let unchanged = self
            .read_documents()?
            .get(&document.id)
            .filter(|existing| existing.content_hash == hash)
            .map(|existing| chunk_ids(&existing.chunks));
        if let Some(ids) = unchanged {
            debug!(document_id = %document.id, "Document unchanged, skipping ingest");
            return Ok(ids);
        }

        let pending = chunk_document(&document, &hash, &self.policy);
        let mut chunks = Vec::with_capacity(pending.len());
        for piece in pending {
            let embedding = self.embed(&piece.text).await?;
            chunks.push(DocumentChunk {
                chunk_id: piece.chunk_id,
                document_id: document.id.clone(),
                ordinal: piece.ordinal,
                text: piece.text,
                embedding,
                reference: piece.reference,
            });
        }

        if let Some(repository) = &self.repository {
            repository.replace_document(&document.id, document.source.as_deref(), &hash, &chunks)?;
        }

        let ids = chunk_ids(&chunks);
        let previous = self.write_documents()?.insert(
            document.id.clone(),
            IndexedDocument {
                content_hash: hash,
                chunks,
            },
        );

        info!(
            document_id = %document.id,
            chunks = ids.len(),
            replaced = previous.is_some(),
            "Ingested document"
        );
        Ok(ids)
    }

    /// The `k` chunks most similar to `text` scoring at least `min_score`.
    ///
    /// Results are ordered by descending score, ties by ascending chunk id.
    pub async fn query(
        &self,
        text: &str,
        k: usize,
        min_score: f32,
    ) -> Result<RetrievalResult, VectorError> {
        if self.is_empty() {
            return Err(VectorError::EmptyIndex);
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embed(text).await?;

        let documents = self.read_documents()?;
        let mut scored: Vec<ScoredChunk> = documents
            .values()
            .flat_map(|doc| doc.chunks.iter())
            .filter_map(|chunk| {
                let score = cosine_similarity(&query_vector, &chunk.embedding);
                (score >= min_score).then(|| ScoredChunk {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect();
        drop(documents);

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        scored.truncate(k);

        debug!(k, min_score, hits = scored.len(), "Queried document index");
        Ok(scored)
    }

    /// Drop a document and its chunks. Returns false if it was not indexed.
    pub async fn remove(&self, document_id: &str) -> Result<bool, VectorError> {
        let _guard = self.ingest_locks.lock(document_id).await;

        if let Some(repository) = &self.repository {
            repository.remove_document(document_id)?;
        }
        let removed = self.write_documents()?.remove(document_id).is_some();
        if removed {
            info!(document_id, "Removed document");
        }
        Ok(removed)
    }

    /// Total number of indexed chunks.
    pub fn len(&self) -> usize {
        self.documents
            .read()
            .map(|docs| docs.values().map(|doc| doc.chunks.len()).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every indexed document, sorted.
    pub fn document_ids(&self) -> Vec<String> {
        self.documents
            .read()
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        match tokio::time::timeout(self.embed_timeout, self.embedder.embed_boxed(text)).await {
            Ok(result) => result,
            Err(_) => Err(VectorError::EmbeddingUnavailable(format!(
                "embedding timed out after {}ms",
                self.embed_timeout.as_millis()
            ))),
        }
    }

    fn read_documents(
        &self,
    ) -> Result<RwLockReadGuard<'_, BTreeMap<String, IndexedDocument>>, VectorError> {
        self.documents
            .read()
            .map_err(|e| ConciergeError::Storage(format!("Lock poisoned: {}", e)).into())
    }

    fn write_documents(
        &self,
    ) -> Result<RwLockWriteGuard<'_, BTreeMap<String, IndexedDocument>>, VectorError> {
        self.documents
            .write()
            .map_err(|e| ConciergeError::Storage(format!("Lock poisoned: {}", e)).into())
    }
}

impl std::fmt::Debug for DocumentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentIndex")
            .field("policy", &self.policy)
            .field("chunks", &self.len())
            .field("persistent", &self.repository.is_some())
            .finish()
    }
}

/// Characters a document id may not contain.
///
/// Chunk ids embed the document id and are cited as `[chunk:<id>]` and
/// recorded in comma-separated turn metadata.
pub fn is_reserved_id_char(c: char) -> bool {
    c.is_whitespace() || matches!(c, '[' | ']' | ',')
}

fn validate_document_id(id: &str) -> Result<(), VectorError> {
    if id.is_empty() {
        return Err(VectorError::InvalidDocument(
            "document id must not be empty".to_string(),
        ));
    }
    if id.chars().any(is_reserved_id_char) {
        return Err(VectorError::InvalidDocument(format!(
            "document id {:?} must not contain whitespace, brackets or commas",
            id
        )));
    }
    Ok(())
}

fn chunk_ids(chunks: &[DocumentChunk]) -> BTreeSet<String> {
    chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect()
}
