//! Request router.
//!
//! Coordinates the full pipeline for one query: read the conversation
//! window, classify, dispatch to the registered handler, record one system
//! turn and return the answer. Requests on the same conversation are
//! serialized; different conversations proceed in parallel.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use concierge_core::config::ConciergeConfig;
use concierge_core::error::ConciergeError;
use concierge_core::locks::KeyedLocks;
use concierge_core::types::{Answer, ClassificationResult, NewTurn, Role, TaskLabel, Turn};
use concierge_storage::{ConversationStore, ConversationStores};

use crate::classifier::TaskClassifier;
use crate::context::{param_key, QUERY_KEY};
use crate::error::{HandlerError, RouterError};
use crate::handler::{HandlerRegistry, TaskRequest};
use crate::lifecycle::{Lifecycle, RequestState};

/// Longest query, in characters, that is classified and dispatched.
pub const MAX_QUERY_CHARS: usize = 4000;

pub const STATUS_KEY: &str = "status";
pub const CITATIONS_KEY: &str = "citations";
pub const CLASSIFICATION_KEY: &str = "classification";

const DEFAULT_CONTEXT_WINDOW: usize = 6;
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

const APOLOGY: &str = "Sorry, I couldn't complete that request right now. Please try again later.";
const EMPTY_QUERY_REPLY: &str =
    "It looks like your message was empty. What can I help you with?";

/// How the task label of a request was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Classified,
    Fallback,
    Skipped,
}

impl Classification {
    fn as_str(&self) -> &'static str {
        match self {
            Classification::Classified => "classified",
            Classification::Fallback => "fallback",
            Classification::Skipped => "skipped",
        }
    }
}

/// The answer to one routed query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedAnswer {
    #[serde(flatten)]
    pub answer: Answer,
    pub conversation_id: String,
    /// `None` when the turn could not be recorded.
    pub turn_id: Option<u64>,
    /// Lifecycle states the request visited, in order.
    pub trace: Vec<RequestState>,
}

pub struct Router {
    stores: ConversationStores,
    classifier: TaskClassifier,
    registry: HandlerRegistry,
    context_window: usize,
    handler_timeout: Duration,
    conversation_locks: KeyedLocks,
}

impl Router {
    pub fn new(
        stores: ConversationStores,
        classifier: TaskClassifier,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            stores,
            classifier,
            registry,
            context_window: DEFAULT_CONTEXT_WINDOW,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            conversation_locks: KeyedLocks::new(),
        }
    }

    pub fn from_config(
        stores: ConversationStores,
        classifier: TaskClassifier,
        registry: HandlerRegistry,
        config: &ConciergeConfig,
    ) -> Self {
        Self::new(stores, classifier, registry)
            .with_context_window(config.memory.context_window)
            .with_handler_timeout(Duration::from_secs(config.router.handler_timeout_secs))
    }

    pub fn with_context_window(mut self, turns: usize) -> Self {
        self.context_window = turns;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn stores(&self) -> &ConversationStores {
        &self.stores
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Route one query within a conversation, creating it on first use.
    ///
    /// Only a blank conversation id or a task with no registered handler
    /// fails the request. Classification, handler and storage failures
    /// degrade the answer instead.
    pub async fn handle(
        &self,
        query: &str,
        conversation_id: &str,
    ) -> Result<RoutedAnswer, RouterError> {
        if conversation_id.trim().is_empty() {
            return Err(RouterError::InvalidConversation(conversation_id.to_string()));
        }

        let span = info_span!("request", conversation_id = %conversation_id);
        self.route(query, conversation_id).instrument(span).await
    }

    async fn route(&self, query: &str, conversation_id: &str) -> Result<RoutedAnswer, RouterError> {
        let _guard = self.conversation_locks.lock(conversation_id).await;

        let mut lifecycle = Lifecycle::new();
        let query = query.trim();

        let store = match self.stores.open(conversation_id) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "Conversation store unavailable, answering without memory");
                None
            }
        };
        let context = self.context(store.as_ref());

        // Classify
        let rejection = rejection_reply(query);
        let (classification, origin) = if rejection.is_some() {
            (ClassificationResult::chat(), Classification::Skipped)
        } else {
            match self.classifier.classify(query, &context).await {
                Ok(result) => (result, Classification::Classified),
                Err(e) => {
                    warn!(error = %e, "Classification unavailable, falling back to chat");
                    (ClassificationResult::chat(), Classification::Fallback)
                }
            }
        };
        lifecycle.advance(RequestState::Classified)?;
        let label = classification.task_label;

        // Dispatch
        let (answer, status) = match rejection {
            Some(reply) => {
                lifecycle.advance(RequestState::Dispatched)?;
                (Answer::new(reply, TaskLabel::Chat), "ok")
            }
            None => {
                let Some(handler) = self.registry.get(label) else {
                    lifecycle.advance(RequestState::Failed)?;
                    error!(task = %label, "No handler registered for task");
                    return Err(RouterError::UnregisteredTask(label));
                };
                lifecycle.advance(RequestState::Dispatched)?;

                let request = TaskRequest {
                    query: query.to_string(),
                    conversation_id: conversation_id.to_string(),
                    parameters: classification.parameters.clone(),
                    context,
                };
                debug!(task = %label, handler = handler.name(), "Dispatching");

                let outcome =
                    tokio::time::timeout(self.handler_timeout, handler.handle(&request))
                        .await
                        .unwrap_or_else(|_| Err(handler_timeout_error(self.handler_timeout)));
                match outcome {
                    Ok(mut answer) => {
                        answer.task_label = label;
                        (answer, "ok")
                    }
                    Err(e) => {
                        warn!(task = %label, error = %e, "Handler failed, returning apology");
                        (Answer::new(APOLOGY, label), "failed")
                    }
                }
            }
        };

        // Record
        let turn = build_turn(query, &answer, &classification, origin, status);
        let appended = match store {
            // SQLite writes and the busy retry block, so they run off the async workers.
            Some(store) => Some(
                tokio::task::spawn_blocking(move || store.append(turn))
                    .await
                    .unwrap_or_else(|e| {
                        Err(ConciergeError::StorageWrite(format!("append task failed: {}", e)))
                    }),
            ),
            None => None,
        };
        let turn_id = match appended {
            Some(Ok(turn_id)) => {
                lifecycle.advance(RequestState::Recorded)?;
                Some(turn_id)
            }
            Some(Err(e)) => {
                warn!(error = %e, "Failed to record turn, returning unrecorded answer");
                None
            }
            None => None,
        };
        lifecycle.advance(RequestState::Returned)?;

        info!(
            task = %answer.task_label,
            status,
            classification = origin.as_str(),
            turn_id,
            citations = answer.citations.len(),
            "Request completed"
        );

        Ok(RoutedAnswer {
            answer,
            conversation_id: conversation_id.to_string(),
            turn_id,
            trace: lifecycle.into_trace(),
        })
    }

    fn context(&self, store: Option<&ConversationStore>) -> Vec<Turn> {
        let Some(store) = store else {
            return Vec::new();
        };
        store.recent(self.context_window).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read conversation window");
            Vec::new()
        })
    }

}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("classifier", &self.classifier)
            .field("registry", &self.registry)
            .field("context_window", &self.context_window)
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

fn handler_timeout_error(timeout: Duration) -> HandlerError {
    HandlerError::Timeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
}

/// A direct reply for queries that are never classified.
fn rejection_reply(query: &str) -> Option<String> {
    if query.is_empty() {
        return Some(EMPTY_QUERY_REPLY.to_string());
    }
    if query.chars().count() > MAX_QUERY_CHARS {
        return Some(format!(
            "That message is too long for me to handle. Please shorten it to {} characters or fewer.",
            MAX_QUERY_CHARS
        ));
    }
    None
}

fn build_turn(
    query: &str,
    answer: &Answer,
    classification: &ClassificationResult,
    origin: Classification,
    status: &str,
) -> NewTurn {
    let mut turn = NewTurn::new(Role::System, answer.text.as_str())
        .with_task_label(answer.task_label)
        .with_metadata(QUERY_KEY, query)
        .with_metadata(STATUS_KEY, status)
        .with_metadata(CLASSIFICATION_KEY, origin.as_str());
    if !answer.citations.is_empty() {
        turn = turn.with_metadata(CITATIONS_KEY, answer.citations.join(","));
    }
    for (name, value) in &classification.parameters {
        turn = turn.with_metadata(param_key(name), value.as_str());
    }
    turn
}
