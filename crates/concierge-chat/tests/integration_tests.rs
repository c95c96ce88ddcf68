//! End-to-end tests for the routing core.
//!
//! Each test wires a router over an in-memory database, a hashing-embedding
//! document index and scripted or offline inference, then drives it through
//! `Router::handle` only.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use concierge_chat::{
    ChatHandler, DocumentQaEngine, ExternalHandler, HandlerError, HandlerRegistry,
    InferenceClient, InferenceError, InferenceService, OfflineInference, PromptPurpose, Router,
    ScriptedInference, TaskClassifier,
};
use concierge_core::types::{Document, NewTurn, Role, TaskLabel};
use concierge_storage::{ConversationStores, Database};
use concierge_vector::{load_document, ChunkingPolicy, DocumentIndex, HashingEmbedding};

// =============================================================================
// Helpers
// =============================================================================

struct EchoWeather;

#[async_trait]
impl ExternalHandler for EchoWeather {
    async fn run(&self, parameters: &BTreeMap<String, String>) -> Result<String, HandlerError> {
        Ok(format!("Forecast for {}: sunny.", parameters["location"]))
    }
}

fn new_index() -> Arc<DocumentIndex> {
    Arc::new(DocumentIndex::new(
        Arc::new(HashingEmbedding::default()),
        ChunkingPolicy::default(),
    ))
}

/// A router whose classifier and handlers use separate inference clients.
fn make_router(
    classifier_client: InferenceClient,
    handler_client: InferenceClient,
    index: Arc<DocumentIndex>,
) -> Router {
    let db = Arc::new(Database::in_memory().unwrap());
    let mut registry = HandlerRegistry::new();
    registry.register(
        TaskLabel::Chat,
        Arc::new(ChatHandler::new(handler_client.clone())),
    );
    registry.register(
        TaskLabel::DocumentQa,
        Arc::new(DocumentQaEngine::new(index, handler_client)),
    );
    registry.register_external(TaskLabel::Weather, Arc::new(EchoWeather));

    Router::new(
        ConversationStores::new(db),
        TaskClassifier::new(classifier_client, 0.7),
        registry,
    )
}

/// Fully offline stack: rule-based inference for everything.
fn offline_router(index: Arc<DocumentIndex>) -> Router {
    let client = InferenceClient::new(Arc::new(OfflineInference::new()));
    make_router(client.clone(), client, index)
}

/// Classifier that always returns `reply`, chat through the offline backend.
fn scripted_router(reply: &str, index: Arc<DocumentIndex>) -> Router {
    let classifier = InferenceClient::new(Arc::new(ScriptedInference::replying(reply)));
    let handlers = InferenceClient::new(Arc::new(OfflineInference::new()));
    make_router(classifier, handlers, index)
}

const DOCUMENT_QA: &str = r#"{"task": "document_qa", "params": {}, "confidence": 0.9}"#;

// =============================================================================
// Conversation memory
// =============================================================================

#[tokio::test]
async fn test_hi_there_records_exactly_one_turn() {
    let router = offline_router(new_index());
    let routed = router.handle("hi there", "conv-1").await.unwrap();

    assert_eq!(routed.answer.task_label, TaskLabel::Chat);
    assert!(!routed.answer.text.is_empty());
    assert_eq!(routed.turn_id, Some(1));

    let store = router.stores().load("conv-1").unwrap();
    assert_eq!(store.len().unwrap(), 1);
    let turn = &store.recent(10).unwrap()[0];
    assert_eq!(turn.role, Role::System);
    assert_eq!(turn.text, routed.answer.text);
    assert_eq!(turn.metadata_value("query"), Some("hi there"));
}

#[tokio::test]
async fn test_recent_window_is_last_n_in_order() {
    let router = offline_router(new_index());
    let store = router.stores().open("conv-1").unwrap();
    for i in 1..=10 {
        store
            .append(NewTurn::new(Role::User, format!("message {i}")))
            .unwrap();
    }

    let window = store.recent(6).unwrap();
    let ids: Vec<u64> = window.iter().map(|t| t.turn_id).collect();
    assert_eq!(ids, vec![5, 6, 7, 8, 9, 10]);
    assert_eq!(window[0].text, "message 5");
    assert!(store.recent(0).unwrap().is_empty());
}

#[tokio::test]
async fn test_conversation_remembers_across_turns() {
    let router = offline_router(new_index());
    router.handle("My name is Alice", "conv-1").await.unwrap();
    let routed = router.handle("What's my name?", "conv-1").await.unwrap();

    assert_eq!(routed.answer.task_label, TaskLabel::Chat);
    assert_eq!(routed.answer.text, "Your name is Alice.");
    assert_eq!(routed.turn_id, Some(2));

    // A different conversation has no memory of it.
    let other = router.handle("What's my name?", "conv-2").await.unwrap();
    assert_eq!(other.answer.text, "I don't know your name yet.");
}

// =============================================================================
// Classification
// =============================================================================

#[tokio::test]
async fn test_weather_without_location_downgrades_to_chat() {
    let router = scripted_router(
        r#"{"task": "weather", "params": {}, "confidence": 0.9}"#,
        new_index(),
    );
    let routed = router.handle("What's the weather?", "conv-1").await.unwrap();
    assert_eq!(routed.answer.task_label, TaskLabel::Chat);
}

#[tokio::test]
async fn test_weather_location_carries_forward() {
    let index = new_index();
    let first = scripted_router(
        r#"{"task": "weather", "params": {"location": "Paris"}, "confidence": 0.9}"#,
        Arc::clone(&index),
    );
    let routed = first.handle("Weather in Paris?", "conv-1").await.unwrap();
    assert_eq!(routed.answer.text, "Forecast for Paris: sunny.");

    // A follow-up in the same conversation that names no location.
    let store = first.stores().load("conv-1").unwrap();
    let classifier = InferenceClient::new(Arc::new(ScriptedInference::replying(
        r#"{"task": "weather", "params": {}, "confidence": 0.9}"#,
    )));
    let follow_up = TaskClassifier::new(classifier, 0.7);
    let result = follow_up
        .classify("And tomorrow?", &store.recent(6).unwrap())
        .await
        .unwrap();
    assert_eq!(result.task_label, TaskLabel::Weather);
    assert_eq!(result.parameter("location"), Some("Paris"));
}

#[tokio::test]
async fn test_classification_timeout_falls_back_to_chat() {
    let slow = Arc::new(
        ScriptedInference::replying(DOCUMENT_QA).with_delay(Duration::from_millis(500)),
    );
    let classifier = InferenceClient::new(slow.clone())
        .with_timeout(Duration::from_millis(20))
        .with_retry_backoff(Duration::from_millis(1));
    let handlers = InferenceClient::new(Arc::new(OfflineInference::new()));
    let router = make_router(classifier, handlers, new_index());

    let routed = router.handle("hi there", "conv-1").await.unwrap();
    assert_eq!(routed.answer.task_label, TaskLabel::Chat);
    assert_eq!(routed.answer.text, "Hello! How can I help you today?");
    assert_eq!(slow.calls(), 2);

    let turns = router.stores().load("conv-1").unwrap().history(None).unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].metadata_value("classification"), Some("fallback"));
}

// =============================================================================
// Document QA
// =============================================================================

#[tokio::test]
async fn test_paris_question_end_to_end() {
    let index = new_index();
    let ids = index
        .ingest(Document::new("geo", "The capital of France is Paris."))
        .await
        .unwrap();
    let router = offline_router(index);

    let routed = router
        .handle("What is the capital of France?", "conv-1")
        .await
        .unwrap();
    assert_eq!(routed.answer.task_label, TaskLabel::DocumentQa);
    assert!(routed.answer.text.contains("Paris"));
    assert_eq!(routed.answer.citations.len(), 1);
    assert!(ids.contains(&routed.answer.citations[0]));

    let turn = &router.stores().load("conv-1").unwrap().recent(1).unwrap()[0];
    assert_eq!(turn.task_label, Some(TaskLabel::DocumentQa));
    assert_eq!(
        turn.metadata_value("citations"),
        Some(routed.answer.citations[0].as_str())
    );
}

#[tokio::test]
async fn test_file_name_with_spaces_is_cited() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("my notes.txt");
    std::fs::write(&path, "The capital of France is Paris.").unwrap();

    let index = new_index();
    let ids = index.ingest(load_document(&path).unwrap()).await.unwrap();
    let router = offline_router(index);

    let routed = router
        .handle("What is the capital of France?", "conv-1")
        .await
        .unwrap();
    assert!(routed.answer.text.contains("Paris"));
    assert_eq!(routed.answer.citations.len(), 1);
    assert!(ids.contains(&routed.answer.citations[0]));
    assert!(routed.answer.citations[0].starts_with("my-notes.txt:"));
}

#[tokio::test]
async fn test_empty_index_differs_from_empty_result() {
    let index = new_index();
    let router = scripted_router(DOCUMENT_QA, Arc::clone(&index));

    let routed = router.handle("What is the capital of France?", "conv-1").await.unwrap();
    assert_eq!(routed.answer.text, "No documents have been ingested yet.");
    assert!(routed.answer.citations.is_empty());

    index
        .ingest(Document::new("geo", "The capital of France is Paris."))
        .await
        .unwrap();
    let routed = router.handle("banana smoothie recipes", "conv-1").await.unwrap();
    assert_eq!(
        routed.answer.text,
        "I couldn't find anything relevant in the ingested documents."
    );
    assert!(routed.answer.citations.is_empty());
}

/// Cites every supplied chunk plus several invented ones.
struct OverCitingInference;

#[async_trait]
impl InferenceService for OverCitingInference {
    fn name(&self) -> &str {
        "over-citing"
    }

    async fn complete(
        &self,
        prompt: &concierge_chat::Prompt,
        _constraints: &concierge_chat::CompletionConstraints,
    ) -> Result<String, InferenceError> {
        match prompt.purpose {
            PromptPurpose::Classification => Ok(DOCUMENT_QA.to_string()),
            _ => {
                let supplied: Vec<String> = prompt
                    .user
                    .lines()
                    .filter_map(|line| line.strip_prefix("[chunk:"))
                    .filter_map(|rest| rest.split(']').next())
                    .map(|id| format!("[chunk:{id}]"))
                    .collect();
                Ok(format!(
                    "Answer {} [chunk:made-up:000000000000:0000] [chunk:other:1:2] [chunk:fake doc:0]",
                    supplied.join(" ")
                ))
            }
        }
    }
}

#[tokio::test]
async fn test_citations_are_subset_of_supplied_chunks() {
    let index = new_index();
    let mut all_ids = BTreeSet::new();
    for (id, text) in [
        ("geo", "The capital of France is Paris. France borders Spain."),
        ("travel", "Paris has many museums, including the Louvre."),
        ("food", "French bread is famous in Paris bakeries."),
    ] {
        all_ids.extend(index.ingest(Document::new(id, text)).await.unwrap());
    }

    let client = InferenceClient::new(Arc::new(OverCitingInference));
    let router = make_router(client.clone(), client, index);

    let routed = router.handle("Tell me about Paris", "conv-1").await.unwrap();
    assert!(!routed.answer.citations.is_empty());
    for citation in &routed.answer.citations {
        assert!(all_ids.contains(citation), "invented citation {citation}");
    }
    assert!(!routed.answer.text.contains("made-up"));
    assert!(!routed.answer.text.contains("other:1:2"));
    assert!(!routed.answer.text.contains("fake doc"));

    let distinct: HashSet<&String> = routed.answer.citations.iter().collect();
    assert_eq!(distinct.len(), routed.answer.citations.len());
}

#[tokio::test]
async fn test_reingest_invalidates_stale_chunk_ids() {
    let index = new_index();
    let v1 = index
        .ingest(Document::new("policy", "Refunds are accepted within 14 days."))
        .await
        .unwrap();
    let again = index
        .ingest(Document::new("policy", "Refunds are accepted within 14 days."))
        .await
        .unwrap();
    assert_eq!(v1, again);

    let v2 = index
        .ingest(Document::new("policy", "Refunds are accepted within 30 days."))
        .await
        .unwrap();
    assert!(v1.is_disjoint(&v2));

    let router = offline_router(Arc::clone(&index));
    let routed = router
        .handle("How many days are refunds accepted?", "conv-1")
        .await
        .unwrap();
    assert_eq!(routed.answer.task_label, TaskLabel::DocumentQa);
    assert!(routed.answer.text.contains("30 days"));
    for citation in &routed.answer.citations {
        assert!(v2.contains(citation));
        assert!(!v1.contains(citation));
    }
}
