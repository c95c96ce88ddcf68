//! Sentence-aware text chunker.
//!
//! Splits each document section into windows of at most `max_chars`
//! characters with `overlap_chars` of overlap between neighbours. A window
//! ends at the last sentence end in its second half when there is one,
//! otherwise it is cut hard on a character boundary.
//!
//! Chunk ids are `{document_id}:{hash12}:{ordinal:04}` where `hash12` is
//! the head of the SHA-256 over the whole document, so ids are stable for
//! unchanged content and never collide with an earlier revision's ids.

use sha2::{Digest, Sha256};

use concierge_core::config::{DocumentQaConfig, MAX_OVERLAP_RATIO};
use concierge_core::types::Document;

/// Hex characters of the content hash embedded in each chunk id.
const CHUNK_HASH_PREFIX: usize = 12;

/// Window size and overlap, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingPolicy {
    max_chars: usize,
    overlap_chars: usize,
}

impl ChunkingPolicy {
    /// Build a policy, clamping overlap to 20% of the window.
    pub fn new(max_chars: usize, overlap_chars: usize) -> Self {
        let max_chars = max_chars.max(1);
        let max_overlap = (max_chars as f64 * MAX_OVERLAP_RATIO).floor() as usize;
        Self {
            max_chars,
            overlap_chars: overlap_chars.min(max_overlap),
        }
    }

    pub fn from_config(config: &DocumentQaConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self::from_config(&DocumentQaConfig::default())
    }
}

/// A chunk that has an id and text but no embedding yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChunk {
    pub chunk_id: String,
    pub ordinal: u32,
    pub text: String,
    pub reference: Option<String>,
}

/// SHA-256 over every section reference and text, as lowercase hex.
pub fn content_hash(document: &Document) -> String {
    let mut hasher = Sha256::new();
    for section in &document.sections {
        hasher.update(section.reference.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(section.text.as_bytes());
        hasher.update([0xffu8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Chunk every section of `document`. Ordinals run across sections.
pub fn chunk_document(
    document: &Document,
    content_hash: &str,
    policy: &ChunkingPolicy,
) -> Vec<PendingChunk> {
    let prefix = &content_hash[..content_hash.len().min(CHUNK_HASH_PREFIX)];
    let mut chunks = Vec::new();

    for section in &document.sections {
        for text in split_text(&section.text, policy) {
            let ordinal = chunks.len() as u32;
            chunks.push(PendingChunk {
                chunk_id: format!("{}:{}:{:04}", document.id, prefix, ordinal),
                ordinal,
                text,
                reference: section.reference.clone(),
            });
        }
    }

    chunks
}

/// Split `text` into trimmed, non-empty windows.
pub fn split_text(text: &str, policy: &ChunkingPolicy) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < total {
        let limit = (start + policy.max_chars).min(total);
        let end = if limit == total {
            total
        } else {
            sentence_break(&chars, start, limit).unwrap_or(limit)
        };

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }

        if end == total {
            break;
        }
        let next = end.saturating_sub(policy.overlap_chars);
        start = if next > start { next } else { end };
    }

    pieces
}

/// Exclusive end of the last sentence in the second half of `start..limit`.
fn sentence_break(chars: &[char], start: usize, limit: usize) -> Option<usize> {
    let earliest = start + (limit - start) / 2;
    (earliest..limit).rev().find_map(|i| {
        let c = chars[i];
        let ends_sentence = matches!(c, '.' | '!' | '?')
            && chars.get(i + 1).is_some_and(|next| next.is_whitespace());
        (c == '\n' || ends_sentence).then_some(i + 1)
    })
}
