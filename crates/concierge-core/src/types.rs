use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// Who produced a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Role::User),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of tasks a query can be routed to.
///
/// `Chat` is the default: unknown or low-confidence intent always lands
/// there so that every query gets some response.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskLabel {
    #[default]
    Chat,
    DocumentQa,
    ImageGeneration,
    Weather,
    Events,
    Sql,
}

impl TaskLabel {
    /// Every label, in prompt order.
    pub const ALL: [TaskLabel; 6] = [
        TaskLabel::DocumentQa,
        TaskLabel::ImageGeneration,
        TaskLabel::Weather,
        TaskLabel::Events,
        TaskLabel::Sql,
        TaskLabel::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskLabel::Chat => "chat",
            TaskLabel::DocumentQa => "document_qa",
            TaskLabel::ImageGeneration => "image_generation",
            TaskLabel::Weather => "weather",
            TaskLabel::Events => "events",
            TaskLabel::Sql => "sql",
        }
    }

    /// Parse a label produced by a classifier.
    ///
    /// Accepts the canonical snake_case names plus the older
    /// `conversation` / `agent_task:<agent>` spellings. Anything else is
    /// `None`; callers decide the fallback.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let label = match normalized.as_str() {
            "chat" | "conversation" => TaskLabel::Chat,
            "document_qa" | "documents" => TaskLabel::DocumentQa,
            "image_generation" | "image" => TaskLabel::ImageGeneration,
            "weather" | "agent_task:weather" => TaskLabel::Weather,
            "events" | "agent_task:recommender" | "agent_task:events" => TaskLabel::Events,
            "sql" | "agent_task:sql" => TaskLabel::Sql,
            _ => return None,
        };
        Some(label)
    }

    /// One-line description used when prompting a classifier.
    pub fn description(&self) -> &'static str {
        match self {
            TaskLabel::Chat => {
                "General conversation, chitchat, questions that don't fit into other categories"
            }
            TaskLabel::DocumentQa => {
                "Answering questions about documents, searching for information in documents, summarizing documents"
            }
            TaskLabel::ImageGeneration => {
                "Generating images, creating pictures, visualizing concepts"
            }
            TaskLabel::Weather => {
                "Weather forecasts, current weather conditions, temperature checks for locations"
            }
            TaskLabel::Events => {
                "Recommending events for a location, taking the weather and user preferences into account"
            }
            TaskLabel::Sql => "Database queries, retrieving or manipulating data in databases",
        }
    }

    /// Parameters a handler for this task cannot run without.
    pub fn required_parameters(&self) -> &'static [&'static str] {
        match self {
            TaskLabel::Weather | TaskLabel::Events => &["location"],
            TaskLabel::Sql => &["query"],
            TaskLabel::Chat | TaskLabel::DocumentQa | TaskLabel::ImageGeneration => &[],
        }
    }
}

impl fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Conversation turns
// =============================================================================

/// One immutable entry in a conversation's log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Monotonic per conversation, starting at 1.
    pub turn_id: u64,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub text: String,
    pub task_label: Option<TaskLabel>,
    pub metadata: BTreeMap<String, String>,
}

impl Turn {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// A turn before the store has assigned its id and timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTurn {
    pub role: Role,
    pub text: String,
    pub task_label: Option<TaskLabel>,
    pub metadata: BTreeMap<String, String>,
}

impl NewTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            task_label: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_task_label(mut self, label: TaskLabel) -> Self {
        self.task_label = Some(label);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A turn found by a cross-conversation search.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TurnMatch {
    pub conversation_id: String,
    pub turn: Turn,
}

/// Summary of a stored conversation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: u64,
}

// =============================================================================
// Documents and retrieval
// =============================================================================

/// A document submitted for indexing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Where the document came from (file path, URL, ...).
    pub source: Option<String>,
    pub sections: Vec<DocumentSection>,
}

/// A contiguous part of a document, e.g. one page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentSection {
    /// Page or section label carried onto every chunk cut from this section.
    pub reference: Option<String>,
    pub text: String,
}

impl Document {
    /// A single-section document.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: None,
            sections: vec![DocumentSection {
                reference: None,
                text: text.into(),
            }],
        }
    }

    /// One section per page, referenced as `page 1`, `page 2`, ...
    pub fn from_pages<I, S>(id: impl Into<String>, pages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sections = pages
            .into_iter()
            .enumerate()
            .map(|(i, text)| DocumentSection {
                reference: Some(format!("page {}", i + 1)),
                text: text.into(),
            })
            .collect();
        Self {
            id: id.into(),
            source: None,
            sections,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// True when no section has any non-whitespace text.
    pub fn is_blank(&self) -> bool {
        self.sections.iter().all(|s| s.text.trim().is_empty())
    }
}

/// An indexed slice of a document. `chunk_id` is the citation key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: u32,
    pub text: String,
    pub embedding: Vec<f32>,
    pub reference: Option<String>,
}

/// A chunk paired with its similarity to a query.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// Ordered best-first, length bounded by the requested k.
pub type RetrievalResult = Vec<ScoredChunk>;

// =============================================================================
// Classification and answers
// =============================================================================

/// Output of the task classifier, consumed immediately by the router.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub task_label: TaskLabel,
    pub parameters: BTreeMap<String, String>,
    /// `None` when the classifier does not report one.
    pub confidence: Option<f32>,
}

impl ClassificationResult {
    /// The default classification: plain conversation, no parameters.
    pub fn chat() -> Self {
        Self::default()
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// The response shape returned to callers of the router.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub task_label: TaskLabel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<String>,
}

impl Answer {
    pub fn new(text: impl Into<String>, task_label: TaskLabel) -> Self {
        Self {
            text: text.into(),
            task_label,
            citations: Vec::new(),
        }
    }

    pub fn with_citations(mut self, citations: Vec<String>) -> Self {
        self.citations = citations;
        self
    }
}
