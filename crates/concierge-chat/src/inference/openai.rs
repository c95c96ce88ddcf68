//! OpenAI-compatible Chat Completions client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use concierge_core::config::InferenceConfig;
use concierge_core::error::ConciergeError;

use super::{CompletionConstraints, InferenceService, Prompt};
use crate::error::InferenceError;

/// Client for `POST {base_url}/chat/completions`.
#[derive(Clone)]
pub struct OpenAiCompatibleInference {
    http_client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl OpenAiCompatibleInference {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConciergeError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConciergeError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            api_key,
            model: model.into(),
            base_url: base_url.into(),
        })
    }

    /// Build from config. The API key is read from `inference.api_key_env`;
    /// it may be absent for local servers that do not check it.
    pub fn from_config(config: &InferenceConfig) -> Result<Self, ConciergeError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        info!(
            model = %config.model,
            base_url = %config.base_url,
            has_api_key = api_key.is_some(),
            "Using OpenAI-compatible inference"
        );
        Self::new(
            config.base_url.clone(),
            api_key,
            config.model.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl InferenceService for OpenAiCompatibleInference {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        constraints: &CompletionConstraints,
    ) -> Result<String, InferenceError> {
        let request_body = ChatCompletionsRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &prompt.system,
                },
                Message {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: constraints.max_tokens,
            temperature: constraints.temperature,
            response_format: constraints
                .json_only
                .then(|| serde_json::json!({"type": "json_object"})),
        };

        let mut request = self
            .http_client
            .post(self.chat_completions_url())
            .json(&request_body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = format!("{}: {}", status.as_u16(), error_text);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                InferenceError::Unavailable(message)
            } else {
                InferenceError::Rejected(message)
            });
        }

        let body: ChatCompletionsResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| InferenceError::InvalidResponse("response has no content".to_string()))
    }
}

impl std::fmt::Debug for OpenAiCompatibleInference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleInference")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}
