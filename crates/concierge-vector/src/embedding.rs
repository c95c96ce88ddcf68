//! Embedding service trait and implementations.
//!
//! - `OpenAiEmbedding` calls an OpenAI-compatible `/embeddings` endpoint.
//! - `HashingEmbedding` is a deterministic bag-of-words feature hasher. It
//!   needs no network and is the default backend.
//! - `MockEmbedding` provides deterministic hash-based vectors for testing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use concierge_core::config::EmbeddingConfig;
use concierge_core::error::ConciergeError;

use crate::error::VectorError;

/// Service for generating text embeddings.
///
/// Used for both ingestion (indexing) and search (query), so a single index
/// must always be paired with the same service.
pub trait EmbeddingService: Send + Sync {
    /// Generate an embedding vector for the given text.
    fn embed(
        &self,
        text: &str,
    ) -> impl std::future::Future<Output = Result<Vec<f32>, VectorError>> + Send;

    /// Return the dimensionality of vectors produced by this service.
    fn dimensions(&self) -> usize;
}

/// Object-safe version of [`EmbeddingService`] for dynamic dispatch.
///
/// A blanket implementation is provided so that every `EmbeddingService`
/// automatically implements `DynEmbeddingService`.
pub trait DynEmbeddingService: Send + Sync {
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Vec<f32>, VectorError>> + Send + 'a>,
    >;

    fn dimensions(&self) -> usize;
}

impl<T: EmbeddingService> DynEmbeddingService for T {
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Vec<f32>, VectorError>> + Send + 'a>,
    > {
        Box::pin(self.embed(text))
    }

    fn dimensions(&self) -> usize {
        EmbeddingService::dimensions(self)
    }
}

/// Build the embedding backend named by `embedding.provider`.
pub fn embedding_from_config(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn DynEmbeddingService>, VectorError> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedding::new(config.dimensions))),
        "openai" => Ok(Arc::new(OpenAiEmbedding::from_config(config)?)),
        "mock" => Ok(Arc::new(MockEmbedding::new())),
        other => Err(ConciergeError::Config(format!("Unknown embedding provider: {}", other)).into()),
    }
}

// ---------------------------------------------------------------------------
// OpenAiEmbedding - OpenAI-compatible HTTP backend
// ---------------------------------------------------------------------------

/// Client for `POST {base_url}/embeddings`.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedding {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedding {
    /// Read the API key from the environment variable named in the config.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, VectorError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            ConciergeError::Config(format!("{} is not set", config.api_key_env))
        })?;
        Self::new(config, api_key)
    }

    pub fn new(config: &EmbeddingConfig, api_key: impl Into<String>) -> Result<Self, VectorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        info!(model = %config.model, dimensions = config.dimensions, "Using OpenAI embeddings");

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }
}

impl EmbeddingService for OpenAiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
            "dimensions": self.dimensions,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(VectorError::EmbeddingUnavailable(format!(
                "embedding API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response.json().await?;
        parse_embedding_response(&json)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Extract `data[0].embedding` from an embeddings API response.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>, VectorError> {
    let values = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|items| items.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            VectorError::EmbeddingUnavailable("response has no data[0].embedding".to_string())
        })?;

    values
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                VectorError::EmbeddingUnavailable("non-numeric embedding value".to_string())
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// HashingEmbedding - offline bag-of-words feature hashing
// ---------------------------------------------------------------------------

/// Words too common to carry meaning for retrieval.
const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "could", "did", "do",
    "does", "for", "from", "how", "i", "in", "is", "it", "me", "my", "of", "on", "or", "please",
    "tell", "that", "the", "this", "to", "was", "were", "what", "when", "where", "which", "who",
    "why", "with", "you", "your",
];

/// Deterministic embedding from hashed word counts.
///
/// Every non-stop-word token is hashed with SHA-256 into one of
/// `dimensions` buckets and counted. The vector is L2-normalized, so cosine
/// similarity measures shared vocabulary. Components are never negative.
#[derive(Debug, Clone)]
pub struct HashingEmbedding {
    dimensions: usize,
}

impl HashingEmbedding {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(head) % self.dimensions as u64) as usize
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            vector[self.bucket(&token)] += 1.0;
        }
        normalize(&mut vector);
        vector
    }
}

impl Default for HashingEmbedding {
    fn default() -> Self {
        Self::new(EmbeddingConfig::default().dimensions)
    }
}

impl EmbeddingService for HashingEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        let vector = self.vectorize(text);
        debug!(dimensions = self.dimensions, "Hashed embedding");
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Lowercased alphanumeric words with stop words removed.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .filter(|word| !STOP_WORDS.contains(&word.as_str()))
}

// ---------------------------------------------------------------------------
// MockEmbedding - deterministic hash-based vectors for testing
// ---------------------------------------------------------------------------

const MOCK_DIMENSIONS: usize = 384;

/// Mock embedding service that returns deterministic 384-dimensional vectors.
///
/// The output is derived from a hash of the whole input, so identical inputs
/// produce identical vectors and any change produces an unrelated one.
#[derive(Debug, Clone, Default)]
pub struct MockEmbedding;

impl MockEmbedding {
    pub fn new() -> Self {
        Self
    }

    fn hash_to_vector(text: &str) -> Vec<f32> {
        let mut result = Vec::with_capacity(MOCK_DIMENSIONS);
        for i in 0..MOCK_DIMENSIONS {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            i.hash(&mut hasher);
            let h = hasher.finish();
            let val = ((h as f64) / (u64::MAX as f64)) * 2.0 - 1.0;
            result.push(val as f32);
        }
        normalize(&mut result);
        result
    }
}

impl EmbeddingService for MockEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        if text.is_empty() {
            return Err(VectorError::InvalidDocument(
                "Cannot embed empty text".to_string(),
            ));
        }
        Ok(Self::hash_to_vector(text))
    }

    fn dimensions(&self) -> usize {
        MOCK_DIMENSIONS
    }
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in vector.iter_mut() {
            *val /= norm;
        }
    }
}

/// Cosine similarity of two vectors.
///
/// Returns 0.0 for mismatched lengths or a zero-magnitude input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hashing_embedding_is_deterministic() {
        let service = HashingEmbedding::new(256);
        let v1 = service.embed("The capital of France").await.unwrap();
        let v2 = service.embed("the CAPITAL of france").await.unwrap();
        assert_eq!(v1, v2);
        assert_eq!(v1.len(), 256);
    }

    #[tokio::test]
    async fn test_hashing_embedding_is_normalized_and_non_negative() {
        let service = HashingEmbedding::default();
        let v = service.embed("rust borrow checker rules").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(v.iter().all(|x| *x >= 0.0));
    }

    #[tokio::test]
    async fn test_hashing_embedding_shared_vocabulary_scores_higher() {
        let service = HashingEmbedding::default();
        let doc = service.embed("The capital of France is Paris.").await.unwrap();
        let related = service.embed("What is the capital of France?").await.unwrap();
        let unrelated = service.embed("Tomorrow brings heavy rain").await.unwrap();

        let related_score = cosine_similarity(&doc, &related);
        assert!(related_score > 0.5, "score was {}", related_score);
        assert!(related_score > cosine_similarity(&doc, &unrelated));
    }

    #[tokio::test]
    async fn test_hashing_embedding_stop_words_only() {
        let service = HashingEmbedding::new(64);
        let v = service.embed("what is the").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_mock_embedding_deterministic() {
        let service = MockEmbedding::new();
        let v1 = service.embed("same text").await.unwrap();
        let v2 = service.embed("same text").await.unwrap();
        assert_eq!(v1, v2);
        assert_ne!(v1, service.embed("other text").await.unwrap());
        assert_eq!(v1.len(), 384);
    }

    #[tokio::test]
    async fn test_mock_embedding_empty_text() {
        let service = MockEmbedding::new();
        assert!(matches!(
            service.embed("").await,
            Err(VectorError::InvalidDocument(_))
        ));
    }

    #[tokio::test]
    async fn test_dyn_dispatch() {
        let service: Arc<dyn DynEmbeddingService> = Arc::new(HashingEmbedding::new(32));
        assert_eq!(service.dimensions(), 32);
        assert_eq!(service.embed_boxed("hello").await.unwrap().len(), 32);
    }

    #[test]
    fn test_embedding_from_config() {
        let config = EmbeddingConfig::default();
        assert_eq!(embedding_from_config(&config).unwrap().dimensions(), 512);

        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(matches!(
            embedding_from_config(&config),
            Err(VectorError::Storage(ConciergeError::Config(_)))
        ));
    }

    #[test]
    fn test_openai_missing_key() {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            api_key_env: "CONCIERGE_TEST_UNSET_EMBEDDING_KEY".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(OpenAiEmbedding::from_config(&config).is_err());
    }

    #[test]
    fn test_parse_embedding_response() {
        let json = serde_json::json!({
            "data": [{"embedding": [0.1, -0.2, 0.3], "index": 0}]
        });
        let v = parse_embedding_response(&json).unwrap();
        assert_eq!(v.len(), 3);
        assert!((v[1] + 0.2).abs() < 1e-6);

        let bad = serde_json::json!({"error": "nope"});
        assert!(matches!(
            parse_embedding_response(&bad),
            Err(VectorError::EmbeddingUnavailable(_))
        ));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
