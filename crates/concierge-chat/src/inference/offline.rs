//! Rule-based inference backend used when no language model is configured.
//!
//! Classification uses compiled keyword patterns, document answers are
//! extractive (the best-matching excerpt sentence, cited), and conversation
//! falls back to a handful of canned replies.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use concierge_core::types::TaskLabel;

use super::{CompletionConstraints, InferenceService, Prompt, PromptPurpose};
use crate::error::InferenceError;
use crate::qa::CITATION_MARKER;

// =============================================================================
// Compiled regex sets (compiled once, reused across calls)
// =============================================================================

struct OfflinePatterns {
    image: Regex,
    weather: Regex,
    events: Regex,
    sql: Regex,
    documents: Regex,
    small_talk: Regex,
    question: Regex,
    location: Regex,
    greeting: Regex,
    thanks: Regex,
    identity: Regex,
    name_statement: Regex,
    name_question: Regex,
}

static PATTERNS: LazyLock<OfflinePatterns> = LazyLock::new(|| {
    let mk = |p: &str| Regex::new(p).expect("Invalid offline regex");
    OfflinePatterns {
        image: mk(
            r"(?i)\b(draw|generate|create|make|paint|render)\b.*\b(image|picture|photo|drawing|illustration|logo)\b|\b(image|picture|photo) of\b",
        ),
        weather: mk(r"(?i)\b(weather|forecast|temperature|raining|rain|sunny|snow|humid)\b"),
        events: mk(
            r"(?i)\b(events?|concerts?|festivals?|exhibitions?|things to do|what's on|happening)\b",
        ),
        sql: mk(r"(?i)\b(sql|database|tables?|rows|records|select\s+\*)\b"),
        documents: mk(
            r"(?i)\b(documents?|docs|files?|pdfs?|report|according to|my notes|ingested)\b",
        ),
        small_talk: mk(
            r"(?i)^\s*(hi|hello|hey|thanks|thank you|good (morning|afternoon|evening))\b|\bhow are you\b|\bwhat'?s up\b|\byour name\b|\bwho are you\b|\bmy name\b",
        ),
        question: mk(
            r"(?i)^\s*(what|who|when|where|which|how|why|is|are|does|do|can|explain|describe|summari[sz]e)\b|\?\s*$",
        ),
        location: mk(
            r"(?i)\b(?:in|for|at|near)\s+([a-z][a-z .'\-]*?)\s*(?:\b(?:today|tomorrow|tonight|this|next|now|on|over)\b|[?.!,]|$)",
        ),
        greeting: mk(r"(?i)^\s*(hi|hello|hey|good (morning|afternoon|evening))\b"),
        thanks: mk(r"(?i)\b(thanks|thank you)\b"),
        identity: mk(r"(?i)\b(who are you|your name)\b"),
        name_statement: mk(r"(?i)\bmy name is ([a-z][\w'\-]*)"),
        name_question: mk(r"(?i)\b(what'?s|what is|do you (know|remember)) my name\b"),
    }
});

const TIME_WORDS: &[&str] = &["today", "tomorrow", "tonight", "now", "the weekend", "this weekend"];

/// Rule-based stand-in for a language model.
#[derive(Debug, Clone, Default)]
pub struct OfflineInference;

impl OfflineInference {
    pub fn new() -> Self {
        Self
    }

    fn classify(&self, query: &str) -> serde_json::Value {
        let p = &*PATTERNS;
        let (task, params, confidence) = if p.image.is_match(query) {
            (TaskLabel::ImageGeneration, json!({ "prompt": query }), 0.9)
        } else if p.weather.is_match(query) {
            (TaskLabel::Weather, location_params(query), 0.9)
        } else if p.events.is_match(query) {
            (TaskLabel::Events, location_params(query), 0.85)
        } else if p.sql.is_match(query) {
            (TaskLabel::Sql, json!({ "query": query }), 0.85)
        } else if p.documents.is_match(query) {
            (TaskLabel::DocumentQa, json!({}), 0.85)
        } else if !p.small_talk.is_match(query) && p.question.is_match(query) {
            (TaskLabel::DocumentQa, json!({}), 0.75)
        } else {
            (TaskLabel::Chat, json!({}), 0.9)
        };

        json!({ "task": task.as_str(), "params": params, "confidence": confidence })
    }

    fn answer_from_excerpts(&self, prompt: &Prompt) -> String {
        let excerpts = parse_excerpts(&prompt.user);
        let query_words = content_words(&prompt.query);

        let mut best: Option<(usize, &str, &str)> = None;
        for (chunk_id, text) in &excerpts {
            for sentence in sentences(text) {
                let overlap = content_words(sentence).intersection(&query_words).count();
                if best.map_or(true, |(score, _, _)| overlap > score) {
                    best = Some((overlap, chunk_id.as_str(), sentence));
                }
            }
        }

        match best {
            Some((_, chunk_id, sentence)) => format!("{} [chunk:{}]", sentence, chunk_id),
            None => "I couldn't find anything relevant in the ingested documents.".to_string(),
        }
    }

    fn converse(&self, prompt: &Prompt) -> String {
        let p = &*PATTERNS;
        let query = prompt.query.as_str();

        if p.name_question.is_match(query) {
            let remembered = p
                .name_statement
                .captures_iter(&prompt.user)
                .filter_map(|caps| caps.get(1))
                .last();
            return match remembered {
                Some(name) => format!("Your name is {}.", name.as_str()),
                None => "I don't know your name yet.".to_string(),
            };
        }
        if let Some(name) = p.name_statement.captures(query).and_then(|caps| caps.get(1)) {
            return format!("Nice to meet you, {}!", name.as_str());
        }
        if p.identity.is_match(query) {
            return "I'm Concierge. I can chat, answer questions about your documents, and pass requests to connected services.".to_string();
        }
        if p.greeting.is_match(query) {
            return "Hello! How can I help you today?".to_string();
        }
        if p.thanks.is_match(query) {
            return "You're welcome!".to_string();
        }
        "I'm running without a language model, so I can only give simple replies. Ask me about your documents, or configure an inference provider for full conversations.".to_string()
    }
}

#[async_trait]
impl InferenceService for OfflineInference {
    fn name(&self) -> &str {
        "offline"
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        _constraints: &CompletionConstraints,
    ) -> Result<String, InferenceError> {
        Ok(match prompt.purpose {
            PromptPurpose::Classification => self.classify(&prompt.query).to_string(),
            PromptPurpose::DocumentQa => self.answer_from_excerpts(prompt),
            PromptPurpose::Conversation => self.converse(prompt),
        })
    }
}

fn location_params(query: &str) -> serde_json::Value {
    let location = PATTERNS
        .location
        .captures_iter(query)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .find(|candidate| {
            !candidate.is_empty() && !TIME_WORDS.contains(&candidate.to_lowercase().as_str())
        });

    match location {
        Some(location) => json!({ "location": location }),
        None => json!({}),
    }
}

/// `(chunk_id, text)` for every `[chunk:<id>]` header in a QA prompt.
///
/// An excerpt's text runs from the line after its header to the next header.
fn parse_excerpts(user: &str) -> Vec<(String, String)> {
    let markers: Vec<_> = CITATION_MARKER.captures_iter(user).collect();
    let mut excerpts = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(id)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let body_start = user[whole.end()..]
            .find('\n')
            .map(|offset| whole.end() + offset + 1)
            .unwrap_or(user.len());
        let body_end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|next| next.start())
            .unwrap_or(user.len())
            .max(body_start);
        excerpts.push((id.as_str().to_string(), user[body_start..body_end].trim().to_string()));
    }

    excerpts
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(|c: char| matches!(c, '.' | '!' | '?' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn content_words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}
