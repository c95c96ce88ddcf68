//! Retrieval-augmented document question answering.
//!
//! Retrieves the best-matching chunks, packs them into a character budget,
//! asks the inference backend to answer from those excerpts only, then
//! validates the `[chunk:<id>]` citations in the reply against the ids that
//! were actually supplied.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use concierge_core::config::DocumentQaConfig;
use concierge_core::types::{Answer, ScoredChunk, TaskLabel};
use concierge_vector::{DocumentIndex, VectorError};

use crate::error::{HandlerError, QaError};
use crate::handler::{TaskHandler, TaskRequest};
use crate::inference::{CompletionConstraints, InferenceClient, Prompt, PromptPurpose};

pub const NO_DOCUMENTS: &str = "No documents have been ingested yet.";
pub const NOTHING_RELEVANT: &str = "I couldn't find anything relevant in the ingested documents.";

/// Matches a citation marker and captures the chunk id.
pub(crate) static CITATION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[chunk:([^\]]+)\]").expect("Invalid citation regex"));

static EXTRA_SPACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("Invalid whitespace regex"));
static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+([.,;:!?])").expect("Invalid punctuation regex"));

const SYSTEM_PROMPT: &str = "You answer questions using only the document excerpts provided. \
Every excerpt starts with a marker like [chunk:<id>]. Cite each excerpt you rely on by \
repeating its marker exactly, right after the sentence that uses it. If the excerpts do not \
contain the answer, say so. Never invent markers.";

/// An excerpt as handed to the synthesis call.
#[derive(Debug, Clone, PartialEq)]
struct Excerpt {
    chunk_id: String,
    reference: Option<String>,
    text: String,
}

#[derive(Debug, Clone)]
pub struct DocumentQaEngine {
    index: Arc<DocumentIndex>,
    client: InferenceClient,
    top_k: usize,
    min_score: f32,
    max_context_chars: usize,
}

impl DocumentQaEngine {
    pub fn new(index: Arc<DocumentIndex>, client: InferenceClient) -> Self {
        Self::from_config(index, client, &DocumentQaConfig::default())
    }

    pub fn from_config(
        index: Arc<DocumentIndex>,
        client: InferenceClient,
        config: &DocumentQaConfig,
    ) -> Self {
        Self {
            index,
            client,
            top_k: config.top_k,
            min_score: config.min_score,
            max_context_chars: config.max_context_chars,
        }
    }

    pub fn with_max_context_chars(mut self, max_context_chars: usize) -> Self {
        self.max_context_chars = max_context_chars;
        self
    }

    pub fn index(&self) -> &Arc<DocumentIndex> {
        &self.index
    }

    /// Answer with the configured `top_k` and `min_score`.
    pub async fn answer_default(&self, query: &str) -> Result<Answer, QaError> {
        self.answer(query, self.top_k, self.min_score).await
    }

    /// Answer `query` from the `k` best chunks scoring at least `min_score`.
    ///
    /// An empty index and an empty retrieval are answers, not errors.
    pub async fn answer(&self, query: &str, k: usize, min_score: f32) -> Result<Answer, QaError> {
        let hits = match self.index.query(query, k, min_score).await {
            Ok(hits) => hits,
            Err(VectorError::EmptyIndex) => {
                debug!("Document question asked with an empty index");
                return Ok(Answer::new(NO_DOCUMENTS, TaskLabel::DocumentQa));
            }
            Err(e) => return Err(e.into()),
        };
        if hits.is_empty() {
            debug!(k, min_score, "No chunk passed the score threshold");
            return Ok(Answer::new(NOTHING_RELEVANT, TaskLabel::DocumentQa));
        }

        let excerpts = pack_excerpts(&hits, self.max_context_chars);
        let prompt = build_prompt(query, &excerpts);
        let reply = self
            .client
            .complete(&prompt, &CompletionConstraints::default())
            .await?;

        let supplied: HashSet<&str> = excerpts.iter().map(|e| e.chunk_id.as_str()).collect();
        let (text, citations) = validate_citations(&reply, &supplied);
        debug!(
            excerpts = excerpts.len(),
            citations = citations.len(),
            "Document answer synthesized"
        );

        Ok(Answer::new(text, TaskLabel::DocumentQa).with_citations(citations))
    }
}

#[async_trait]
impl TaskHandler for DocumentQaEngine {
    fn name(&self) -> &str {
        "document_qa"
    }

    async fn handle(&self, request: &TaskRequest) -> Result<Answer, HandlerError> {
        Ok(self.answer_default(&request.query).await?)
    }
}

/// Take chunks in score order until the character budget is spent.
///
/// The first chunk is truncated if it alone exceeds the budget; later chunks
/// that do not fit are skipped so a smaller one further down can still use
/// the remaining room.
fn pack_excerpts(hits: &[ScoredChunk], budget: usize) -> Vec<Excerpt> {
    let mut excerpts = Vec::new();
    let mut remaining = budget;

    for (i, hit) in hits.iter().enumerate() {
        let len = hit.chunk.text.chars().count();
        let text = if len <= remaining {
            hit.chunk.text.clone()
        } else if i == 0 {
            hit.chunk.text.chars().take(remaining).collect()
        } else {
            continue;
        };
        remaining -= text.chars().count();
        excerpts.push(Excerpt {
            chunk_id: hit.chunk.chunk_id.clone(),
            reference: hit.chunk.reference.clone(),
            text,
        });
    }

    excerpts
}

fn build_prompt(query: &str, excerpts: &[Excerpt]) -> Prompt {
    let mut user = format!("Question: {}\n\nExcerpts:\n", query);
    for excerpt in excerpts {
        user.push_str(&format!("\n[chunk:{}]", excerpt.chunk_id));
        if let Some(reference) = &excerpt.reference {
            user.push_str(&format!(" ({})", reference));
        }
        user.push('\n');
        user.push_str(&excerpt.text);
        user.push('\n');
    }
    Prompt::new(PromptPurpose::DocumentQa, SYSTEM_PROMPT, user, query)
}

/// Strip markers citing ids that were not supplied and collect the rest.
///
/// Citations are the distinct valid ids in order of first appearance.
fn validate_citations(reply: &str, supplied: &HashSet<&str>) -> (String, Vec<String>) {
    let mut citations: Vec<String> = Vec::new();
    let mut stripped = 0usize;

    let text = CITATION_MARKER.replace_all(reply, |caps: &regex::Captures<'_>| {
        let id = &caps[1];
        if supplied.contains(id) {
            if !citations.iter().any(|c| c == id) {
                citations.push(id.to_string());
            }
            caps[0].to_string()
        } else {
            stripped += 1;
            String::new()
        }
    });

    let text = if stripped > 0 {
        warn!(stripped, "Removed citations of chunks that were not supplied");
        let text = EXTRA_SPACES.replace_all(&text, " ");
        SPACE_BEFORE_PUNCT.replace_all(&text, "$1").into_owned()
    } else {
        text.into_owned()
    };

    (text.trim().to_string(), citations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use concierge_core::types::{Document, DocumentChunk};
    use concierge_vector::{ChunkingPolicy, EmbeddingService, HashingEmbedding};

    use crate::inference::{OfflineInference, ScriptedInference};

    fn index() -> Arc<DocumentIndex> {
        Arc::new(DocumentIndex::new(
            Arc::new(HashingEmbedding::default()),
            ChunkingPolicy::default(),
        ))
    }

    fn hit(chunk_id: &str, text: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: DocumentChunk {
                chunk_id: chunk_id.to_string(),
                document_id: "doc".to_string(),
                ordinal: 0,
                text: text.to_string(),
                embedding: Vec::new(),
                reference: None,
            },
            score,
        }
    }

    #[tokio::test]
    async fn test_empty_index_answer() {
        let service = Arc::new(ScriptedInference::replying("unused"));
        let engine = DocumentQaEngine::new(index(), InferenceClient::new(service.clone()));
        let answer = engine.answer_default("What is the capital of France?").await.unwrap();
        assert_eq!(answer.text, NO_DOCUMENTS);
        assert!(answer.citations.is_empty());
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn test_nothing_relevant_answer() {
        let index = index();
        index
            .ingest(Document::new("geo", "The capital of France is Paris."))
            .await
            .unwrap();
        let service = Arc::new(ScriptedInference::replying("unused"));
        let engine = DocumentQaEngine::new(index, InferenceClient::new(service.clone()));

        let answer = engine.answer("banana smoothie recipes", 4, 0.2).await.unwrap();
        assert_eq!(answer.text, NOTHING_RELEVANT);
        assert!(answer.citations.is_empty());
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn test_paris_answer_with_offline_backend() {
        let index = index();
        let ids = index
            .ingest(Document::new("geo", "The capital of France is Paris."))
            .await
            .unwrap();
        let engine = DocumentQaEngine::new(
            index,
            InferenceClient::new(Arc::new(OfflineInference::new())),
        );

        let answer = engine.answer_default("What is the capital of France?").await.unwrap();
        assert!(answer.text.contains("Paris"));
        assert_eq!(answer.task_label, TaskLabel::DocumentQa);
        assert_eq!(answer.citations.len(), 1);
        assert!(ids.contains(&answer.citations[0]));
    }

    #[tokio::test]
    async fn test_invented_citations_are_stripped() {
        let index = index();
        let ids = index
            .ingest(Document::new("geo", "The capital of France is Paris."))
            .await
            .unwrap();
        let real = ids.iter().next().unwrap().clone();
        let reply = format!(
            "Paris [chunk:{real}] is the capital [chunk:geo:ffffffffffff:0009]. See also [chunk:{real}]."
        );
        let engine = DocumentQaEngine::new(
            index,
            InferenceClient::new(Arc::new(ScriptedInference::replying(reply))),
        );

        let answer = engine.answer_default("capital of France").await.unwrap();
        assert_eq!(answer.citations, vec![real.clone()]);
        assert!(!answer.text.contains("ffffffffffff"));
        assert_eq!(
            answer.text,
            format!("Paris [chunk:{real}] is the capital. See also [chunk:{real}].")
        );
    }

    #[tokio::test]
    async fn test_retrieval_failure_is_error() {
        /// Embeds normally until switched off.
        struct Flaky {
            inner: HashingEmbedding,
            down: AtomicBool,
        }

        impl EmbeddingService for Flaky {
            async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
                if self.down.load(Ordering::SeqCst) {
                    return Err(VectorError::EmbeddingUnavailable("down".to_string()));
                }
                self.inner.embed(text).await
            }

            fn dimensions(&self) -> usize {
                EmbeddingService::dimensions(&self.inner)
            }
        }

        let embedder = Arc::new(Flaky {
            inner: HashingEmbedding::default(),
            down: AtomicBool::new(false),
        });
        let index = Arc::new(DocumentIndex::new(embedder.clone(), ChunkingPolicy::default()));
        index.ingest(Document::new("a", "some text")).await.unwrap();
        embedder.down.store(true, Ordering::SeqCst);

        let engine = DocumentQaEngine::new(
            index,
            InferenceClient::new(Arc::new(ScriptedInference::replying("x"))),
        );
        let err = engine.answer_default("anything").await.unwrap_err();
        assert!(matches!(
            err,
            QaError::Retrieval(VectorError::EmbeddingUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_prompt_contains_excerpts_and_references() {
        let index = index();
        index
            .ingest(Document::from_pages(
                "atlas",
                ["Paris is the capital of France.", "Berlin is the capital of Germany."],
            ))
            .await
            .unwrap();
        let service = Arc::new(ScriptedInference::replying("I don't know."));
        let engine = DocumentQaEngine::new(index, InferenceClient::new(service.clone()));

        let answer = engine.answer("capital of France", 4, 0.0).await.unwrap();
        assert_eq!(answer.text, "I don't know.");
        assert!(answer.citations.is_empty());

        let prompt = &service.prompts()[0];
        assert_eq!(prompt.purpose, PromptPurpose::DocumentQa);
        assert!(prompt.user.starts_with("Question: capital of France\n\nExcerpts:\n"));
        assert!(prompt.user.contains("(page 1)\nParis is the capital of France."));
        assert!(prompt.user.contains("[chunk:atlas:"));
    }

    #[test]
    fn test_pack_excerpts_budget() {
        let hits = vec![
            hit("a", "0123456789", 0.9),
            hit("b", "abcdefghij", 0.8),
            hit("c", "xyz", 0.7),
        ];

        let packed = pack_excerpts(&hits, 14);
        let ids: Vec<_> = packed.iter().map(|e| e.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let packed = pack_excerpts(&hits, 4);
        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0].text, "0123");
    }

    #[test]
    fn test_markers_with_spaces_are_stripped() {
        let supplied: HashSet<&str> = ["geo:1"].into_iter().collect();
        let (text, citations) =
            validate_citations("Paris [chunk:geo:1]. Also [chunk:fake doc:0].", &supplied);
        assert_eq!(citations, vec!["geo:1".to_string()]);
        assert_eq!(text, "Paris [chunk:geo:1]. Also.");
    }

    #[test]
    fn test_validate_citations_order_and_dedup() {
        let supplied: HashSet<&str> = ["x:1", "y:2"].into_iter().collect();
        let (text, citations) =
            validate_citations("B [chunk:y:2] then A [chunk:x:1] and B [chunk:y:2]", &supplied);
        assert_eq!(citations, vec!["y:2".to_string(), "x:1".to_string()]);
        assert_eq!(text, "B [chunk:y:2] then A [chunk:x:1] and B [chunk:y:2]");
    }
}
