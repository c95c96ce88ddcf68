use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConciergeError, Result};

/// Largest allowed chunk overlap, as a fraction of the chunk size.
pub const MAX_OVERLAP_RATIO: f64 = 0.2;

/// Top-level configuration for the Concierge application.
///
/// Loaded from `~/.concierge/config.toml` by default. Each section
/// corresponds to one component of the routing core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConciergeConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub document_qa: DocumentQaConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

impl ConciergeConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConciergeConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let qa = &self.document_qa;
        if qa.chunk_size == 0 {
            return Err(ConciergeError::Config(
                "document_qa.chunk_size must be greater than 0".to_string(),
            ));
        }
        if qa.chunk_overlap as f64 > qa.chunk_size as f64 * MAX_OVERLAP_RATIO {
            return Err(ConciergeError::Config(format!(
                "document_qa.chunk_overlap ({}) exceeds 20% of chunk_size ({})",
                qa.chunk_overlap, qa.chunk_size
            )));
        }
        if qa.top_k == 0 {
            return Err(ConciergeError::Config(
                "document_qa.top_k must be greater than 0".to_string(),
            ));
        }
        if !(-1.0..=1.0).contains(&qa.min_score) {
            return Err(ConciergeError::Config(format!(
                "document_qa.min_score ({}) must be within [-1, 1]",
                qa.min_score
            )));
        }
        if !(0.0..=1.0).contains(&self.classifier.confidence_threshold) {
            return Err(ConciergeError::Config(format!(
                "classifier.confidence_threshold ({}) must be within [0, 1]",
                self.classifier.confidence_threshold
            )));
        }
        if self.inference.timeout_secs == 0 || self.embedding.timeout_secs == 0 {
            return Err(ConciergeError::Config(
                "timeouts must be at least one second".to_string(),
            ));
        }
        if self.router.handler_timeout_secs == 0 {
            return Err(ConciergeError::Config(
                "router.handler_timeout_secs must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    /// `general.data_dir` with a leading `~` expanded against `$HOME`.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    /// Path of the SQLite database holding conversations and chunks.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("concierge.db")
    }

    /// `document_qa.documents_dir` with `~` expanded.
    pub fn documents_dir(&self) -> PathBuf {
        expand_home(&self.document_qa.documents_dir)
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.concierge/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// LLM inference backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// "openai" (any OpenAI-compatible endpoint) or "offline".
    pub provider: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Delay before the single retry of a transient failure.
    pub retry_backoff_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            provider: "offline".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.0,
            max_tokens: 512,
            timeout_secs: 30,
            retry_backoff_ms: 250,
        }
    }
}

/// Embedding backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "openai" or "hashing".
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub base_url: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 512,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Conversation memory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of recent turns handed to the classifier and chat handler.
    pub context_window: usize,
    /// Default number of turns returned by history listings.
    pub max_history: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_window: 6,
            max_history: 20,
        }
    }
}

/// Task classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Reported confidence below this routes to chat.
    pub confidence_threshold: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
        }
    }
}

/// Document indexing and question answering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentQaConfig {
    /// Maximum chunk length in characters.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks (at most 20% of chunk_size).
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub min_score: f32,
    /// Character budget for excerpts handed to the synthesis call.
    pub max_context_chars: usize,
    pub documents_dir: String,
}

impl Default for DocumentQaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            top_k: 4,
            min_score: 0.2,
            max_context_chars: 6000,
            documents_dir: "~/.concierge/documents".to_string(),
        }
    }
}

/// Request router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Upper bound on a single handler call.
    pub handler_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 60,
        }
    }
}
