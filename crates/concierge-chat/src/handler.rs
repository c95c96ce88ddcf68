//! Task handler registry and trait definitions.
//!
//! Defines the `TaskHandler` async trait the router dispatches to, the
//! narrower `ExternalHandler` trait for domain agents (weather, events,
//! SQL, image generation) and the registry mapping each task to one
//! handler.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use concierge_core::types::{Answer, TaskLabel, Turn};

use crate::context::render_context;
use crate::error::HandlerError;
use crate::inference::{CompletionConstraints, InferenceClient, Prompt, PromptPurpose};

/// Parameter key under which external handlers receive the raw query.
pub const REQUEST_PARAM: &str = "request";

/// Everything a handler gets for one dispatched query.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub query: String,
    pub conversation_id: String,
    /// Parameters extracted by the classifier.
    pub parameters: BTreeMap<String, String>,
    /// Recent turns, oldest first.
    pub context: Vec<Turn>,
}

impl TaskRequest {
    pub fn new(query: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            conversation_id: conversation_id.into(),
            parameters: BTreeMap::new(),
            context: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_context(mut self, context: Vec<Turn>) -> Self {
        self.context = context;
        self
    }
}

/// Something the router can dispatch a classified query to.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn handle(&self, request: &TaskRequest) -> Result<Answer, HandlerError>;
}

/// A domain agent reached through its parameters only.
///
/// The parameters include every classified parameter plus the raw query
/// under [`REQUEST_PARAM`].
#[async_trait]
pub trait ExternalHandler: Send + Sync {
    async fn run(&self, parameters: &BTreeMap<String, String>) -> Result<String, HandlerError>;
}

/// Adapts an [`ExternalHandler`] to [`TaskHandler`] for one task label.
struct ExternalTask {
    label: TaskLabel,
    handler: Arc<dyn ExternalHandler>,
}

#[async_trait]
impl TaskHandler for ExternalTask {
    fn name(&self) -> &str {
        self.label.as_str()
    }

    async fn handle(&self, request: &TaskRequest) -> Result<Answer, HandlerError> {
        for &name in self.label.required_parameters() {
            let present = request
                .parameters
                .get(name)
                .is_some_and(|value| !value.trim().is_empty());
            if !present {
                return Err(HandlerError::MissingParameter(name.to_string()));
            }
        }

        let mut parameters = request.parameters.clone();
        parameters.insert(REQUEST_PARAM.to_string(), request.query.clone());

        let text = self.handler.run(&parameters).await?;
        Ok(Answer::new(text, self.label))
    }
}

/// Static table of handlers, one per task label.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskLabel, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `label`, replacing any earlier registration.
    pub fn register(&mut self, label: TaskLabel, handler: Arc<dyn TaskHandler>) {
        info!(task = %label, handler = handler.name(), "Registered task handler");
        if let Some(previous) = self.handlers.insert(label, handler) {
            warn!(task = %label, previous = previous.name(), "Replaced task handler");
        }
    }

    /// Register a domain agent for `label`.
    pub fn register_external(&mut self, label: TaskLabel, handler: Arc<dyn ExternalHandler>) {
        self.register(label, Arc::new(ExternalTask { label, handler }));
    }

    pub fn get(&self, label: TaskLabel) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&label).cloned()
    }

    /// Registered labels, sorted.
    pub fn labels(&self) -> Vec<TaskLabel> {
        let mut labels: Vec<TaskLabel> = self.handlers.keys().copied().collect();
        labels.sort();
        labels
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("labels", &self.labels())
            .finish()
    }
}

const CHAT_SYSTEM_PROMPT: &str = "You are Concierge, a friendly and concise personal assistant. \
Use the conversation so far to stay consistent, for example remembering what the user told you \
about themselves.";

/// General conversation through the inference backend.
#[derive(Debug, Clone)]
pub struct ChatHandler {
    client: InferenceClient,
    constraints: CompletionConstraints,
}

impl ChatHandler {
    pub fn new(client: InferenceClient) -> Self {
        Self {
            client,
            constraints: CompletionConstraints::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: CompletionConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

#[async_trait]
impl TaskHandler for ChatHandler {
    fn name(&self) -> &str {
        "chat"
    }

    async fn handle(&self, request: &TaskRequest) -> Result<Answer, HandlerError> {
        let transcript = render_context(&request.context);
        let user = if transcript.is_empty() {
            format!("User: {}", request.query)
        } else {
            format!("{}\nUser: {}", transcript, request.query)
        };
        let prompt = Prompt::new(
            PromptPurpose::Conversation,
            CHAT_SYSTEM_PROMPT,
            user,
            request.query.as_str(),
        );

        let text = self.client.complete(&prompt, &self.constraints).await?;
        debug!(
            conversation_id = %request.conversation_id,
            context_turns = request.context.len(),
            "Chat reply generated"
        );
        Ok(Answer::new(text.trim(), TaskLabel::Chat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use concierge_core::types::Role;

    use crate::inference::{OfflineInference, ScriptedInference};

    /// Records the parameters it was run with.
    #[derive(Default)]
    struct RecordingAgent {
        seen: Mutex<Vec<BTreeMap<String, String>>>,
    }

    #[async_trait]
    impl ExternalHandler for RecordingAgent {
        async fn run(&self, parameters: &BTreeMap<String, String>) -> Result<String, HandlerError> {
            self.seen.lock().unwrap().push(parameters.clone());
            Ok(format!(
                "Sunny in {}",
                parameters.get("location").cloned().unwrap_or_default()
            ))
        }
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_external_handler_receives_params_and_request() {
        let agent = Arc::new(RecordingAgent::default());
        let mut registry = HandlerRegistry::new();
        registry.register_external(TaskLabel::Weather, agent.clone());

        let handler = registry.get(TaskLabel::Weather).unwrap();
        assert_eq!(handler.name(), "weather");

        let request = TaskRequest::new("weather in Paris?", "conv-1")
            .with_parameters(params(&[("location", "Paris")]));
        let answer = handler.handle(&request).await.unwrap();
        assert_eq!(answer.text, "Sunny in Paris");
        assert_eq!(answer.task_label, TaskLabel::Weather);

        let seen = agent.seen.lock().unwrap();
        assert_eq!(seen[0].get("location").map(String::as_str), Some("Paris"));
        assert_eq!(
            seen[0].get(REQUEST_PARAM).map(String::as_str),
            Some("weather in Paris?")
        );
    }

    #[tokio::test]
    async fn test_external_handler_missing_parameter() {
        let agent = Arc::new(RecordingAgent::default());
        let mut registry = HandlerRegistry::new();
        registry.register_external(TaskLabel::Weather, agent.clone());

        let request = TaskRequest::new("weather?", "conv-1")
            .with_parameters(params(&[("location", " ")]));
        let err = registry
            .get(TaskLabel::Weather)
            .unwrap()
            .handle(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::MissingParameter(ref p) if p == "location"));
        assert!(agent.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_registry_labels_and_replacement() {
        let client = InferenceClient::new(Arc::new(OfflineInference::new()));
        let mut registry = HandlerRegistry::new();
        assert!(registry.get(TaskLabel::Chat).is_none());

        registry.register(TaskLabel::Chat, Arc::new(ChatHandler::new(client.clone())));
        registry.register_external(TaskLabel::Sql, Arc::new(RecordingAgent::default()));
        registry.register(TaskLabel::Chat, Arc::new(ChatHandler::new(client)));

        assert_eq!(registry.labels(), vec![TaskLabel::Chat, TaskLabel::Sql]);
    }

    #[tokio::test]
    async fn test_chat_handler_renders_context() {
        let service = Arc::new(ScriptedInference::replying("  Hi Alice!  "));
        let handler = ChatHandler::new(InferenceClient::new(service.clone()));
        let context = vec![Turn {
            turn_id: 1,
            timestamp: Utc::now(),
            role: Role::System,
            text: "Nice to meet you, Alice!".to_string(),
            task_label: Some(TaskLabel::Chat),
            metadata: params(&[("query", "My name is Alice")]),
        }];

        let request = TaskRequest::new("Say hi", "conv-1").with_context(context);
        let answer = handler.handle(&request).await.unwrap();
        assert_eq!(answer.text, "Hi Alice!");
        assert_eq!(answer.task_label, TaskLabel::Chat);
        assert!(answer.citations.is_empty());

        let prompt = &service.prompts()[0];
        assert_eq!(prompt.purpose, PromptPurpose::Conversation);
        assert_eq!(
            prompt.user,
            "User: My name is Alice\nAssistant: Nice to meet you, Alice!\nUser: Say hi"
        );
    }

    #[tokio::test]
    async fn test_chat_handler_inference_failure() {
        let service = Arc::new(ScriptedInference::failing(
            crate::error::InferenceError::Rejected("bad request".to_string()),
        ));
        let handler = ChatHandler::new(InferenceClient::new(service));
        let err = handler
            .handle(&TaskRequest::new("hi", "conv-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
    }
}
