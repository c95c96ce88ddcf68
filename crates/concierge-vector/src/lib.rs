//! Concierge vector crate - document chunking, embeddings and retrieval.
//!
//! Documents are split into overlapping chunks, embedded through an
//! [`EmbeddingService`], and held in a [`DocumentIndex`] that answers
//! cosine-similarity queries. Chunk sets can be persisted through
//! `concierge-storage` and reloaded at startup.

pub mod chunker;
pub mod embedding;
pub mod error;
pub mod index;
pub mod loader;

pub use chunker::{chunk_document, content_hash, split_text, ChunkingPolicy, PendingChunk};
pub use embedding::{
    cosine_similarity, embedding_from_config, DynEmbeddingService, EmbeddingService,
    HashingEmbedding, MockEmbedding, OpenAiEmbedding,
};
pub use error::VectorError;
pub use index::{is_reserved_id_char, DocumentIndex};
pub use loader::{document_id, list_documents, load_document, load_path};
