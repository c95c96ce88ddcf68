//! LLM inference capability.
//!
//! Defines the `InferenceService` async trait, the prompt and constraint
//! types passed to it, and `InferenceClient`, which bounds every call with
//! a timeout and retries transient failures once.

pub mod offline;
pub mod openai;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use concierge_core::config::InferenceConfig;
use concierge_core::error::ConciergeError;

use crate::error::InferenceError;

pub use offline::OfflineInference;
pub use openai::OpenAiCompatibleInference;
pub use scripted::ScriptedInference;

/// What a prompt is for. Lets scripted and offline backends answer each
/// kind of call appropriately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptPurpose {
    Classification,
    DocumentQa,
    Conversation,
}

impl PromptPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptPurpose::Classification => "classification",
            PromptPurpose::DocumentQa => "document_qa",
            PromptPurpose::Conversation => "conversation",
        }
    }
}

/// A two-part prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub purpose: PromptPurpose,
    pub system: String,
    pub user: String,
    /// The end-user query this prompt was built for.
    pub query: String,
}

impl Prompt {
    pub fn new(
        purpose: PromptPurpose,
        system: impl Into<String>,
        user: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            purpose,
            system: system.into(),
            user: user.into(),
            query: query.into(),
        }
    }
}

/// Limits applied to one completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionConstraints {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the backend for a JSON object reply.
    pub json_only: bool,
}

impl CompletionConstraints {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            json_only: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_only = true;
        self
    }
}

impl Default for CompletionConstraints {
    fn default() -> Self {
        Self::from_config(&InferenceConfig::default())
    }
}

/// A text-completion backend.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    async fn complete(
        &self,
        prompt: &Prompt,
        constraints: &CompletionConstraints,
    ) -> Result<String, InferenceError>;
}

/// Build the backend named by `inference.provider`.
pub fn inference_from_config(
    config: &InferenceConfig,
) -> Result<Arc<dyn InferenceService>, ConciergeError> {
    match config.provider.as_str() {
        "offline" => Ok(Arc::new(OfflineInference::new())),
        "openai" => Ok(Arc::new(OpenAiCompatibleInference::from_config(config)?)),
        other => Err(ConciergeError::Config(format!(
            "Unknown inference provider: {}",
            other
        ))),
    }
}

/// Inference with a per-call timeout and one retry for transient failures.
#[derive(Clone)]
pub struct InferenceClient {
    service: Arc<dyn InferenceService>,
    timeout: Duration,
    retry_backoff: Duration,
}

impl InferenceClient {
    pub fn new(service: Arc<dyn InferenceService>) -> Self {
        Self::from_config(service, &InferenceConfig::default())
    }

    pub fn from_config(service: Arc<dyn InferenceService>, config: &InferenceConfig) -> Self {
        Self {
            service,
            timeout: Duration::from_secs(config.timeout_secs),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Run a completion. Rejected and malformed replies are never retried.
    pub async fn complete(
        &self,
        prompt: &Prompt,
        constraints: &CompletionConstraints,
    ) -> Result<String, InferenceError> {
        match self.attempt(prompt, constraints).await {
            Err(err) if err.is_transient() => {
                warn!(
                    service = self.service.name(),
                    purpose = prompt.purpose.as_str(),
                    error = %err,
                    "Inference failed, retrying once"
                );
                tokio::time::sleep(self.retry_backoff).await;
                self.attempt(prompt, constraints).await
            }
            result => result,
        }
    }

    async fn attempt(
        &self,
        prompt: &Prompt,
        constraints: &CompletionConstraints,
    ) -> Result<String, InferenceError> {
        let reply = tokio::time::timeout(self.timeout, self.service.complete(prompt, constraints))
            .await
            .map_err(|_| InferenceError::Timeout(self.timeout.as_millis() as u64))??;

        debug!(
            service = self.service.name(),
            purpose = prompt.purpose.as_str(),
            reply_len = reply.len(),
            "Inference completed"
        );
        Ok(reply)
    }
}

impl std::fmt::Debug for InferenceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceClient")
            .field("service", &self.service.name())
            .field("timeout", &self.timeout)
            .field("retry_backoff", &self.retry_backoff)
            .finish()
    }
}
