//! LLM-backed task classifier.
//!
//! Prompts the inference backend with the closed task set and the recent
//! conversation, then validates the JSON reply. Anything that cannot be
//! trusted (unparseable output, an unknown label, low confidence, a missing
//! required parameter) lands on [`TaskLabel::Chat`].

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, warn};

use concierge_core::config::ClassifierConfig;
use concierge_core::types::{ClassificationResult, TaskLabel, Turn};

use crate::context::{carried_parameter, render_context};
use crate::error::ClassifyError;
use crate::inference::{CompletionConstraints, InferenceClient, Prompt, PromptPurpose};

const SYSTEM_PROMPT: &str = "You are the task classifier of a personal assistant. \
Decide which task should handle the user's latest query and extract the parameters \
that task needs. Reply with a single JSON object and nothing else.";

/// Shape of the classifier's JSON reply.
#[derive(Debug, Deserialize)]
struct RawClassification {
    task: String,
    #[serde(default)]
    params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct TaskClassifier {
    client: InferenceClient,
    confidence_threshold: f32,
}

impl TaskClassifier {
    pub fn new(client: InferenceClient, confidence_threshold: f32) -> Self {
        Self {
            client,
            confidence_threshold,
        }
    }

    pub fn from_config(client: InferenceClient, config: &ClassifierConfig) -> Self {
        Self::new(client, config.confidence_threshold)
    }

    /// Classify `query` given the recent conversation.
    ///
    /// Only an inference failure is an error; every other problem degrades
    /// to a chat classification.
    pub async fn classify(
        &self,
        query: &str,
        context: &[Turn],
    ) -> Result<ClassificationResult, ClassifyError> {
        let prompt = build_prompt(query, context);
        let constraints = CompletionConstraints::default().json();
        let reply = self.client.complete(&prompt, &constraints).await?;

        let Some(raw) = parse_reply(&reply) else {
            warn!(reply_len = reply.len(), "Unparseable classifier reply, using chat");
            return Ok(ClassificationResult::chat());
        };

        let result = self.validate(raw, context);
        debug!(
            task = %result.task_label,
            confidence = ?result.confidence,
            params = result.parameters.len(),
            "Query classified"
        );
        Ok(result)
    }

    fn validate(&self, raw: RawClassification, context: &[Turn]) -> ClassificationResult {
        let Some(task_label) = TaskLabel::parse(&raw.task) else {
            warn!(task = %raw.task, "Unknown task label, using chat");
            return ClassificationResult::chat();
        };

        if let Some(confidence) = raw.confidence {
            if confidence < self.confidence_threshold {
                debug!(
                    task = %task_label,
                    confidence,
                    threshold = self.confidence_threshold,
                    "Low confidence, using chat"
                );
                return ClassificationResult {
                    confidence: Some(confidence),
                    ..ClassificationResult::chat()
                };
            }
        }

        let mut parameters = stringify_params(raw.params);
        for &name in task_label.required_parameters() {
            if parameters.contains_key(name) {
                continue;
            }
            match carried_parameter(context, name) {
                Some(value) => {
                    debug!(task = %task_label, parameter = name, "Carried parameter from context");
                    parameters.insert(name.to_string(), value);
                }
                None => {
                    debug!(
                        task = %task_label,
                        parameter = name,
                        "Required parameter missing, using chat"
                    );
                    return ClassificationResult {
                        confidence: raw.confidence,
                        ..ClassificationResult::chat()
                    };
                }
            }
        }

        ClassificationResult {
            task_label,
            parameters,
            confidence: raw.confidence,
        }
    }
}

fn build_prompt(query: &str, context: &[Turn]) -> Prompt {
    let mut tasks = String::new();
    for label in TaskLabel::ALL {
        let required = label.required_parameters();
        let required = if required.is_empty() {
            "none".to_string()
        } else {
            required.join(", ")
        };
        tasks.push_str(&format!(
            "- {}: {} (required parameters: {})\n",
            label.as_str(),
            label.description(),
            required
        ));
    }

    let transcript = render_context(context);
    let transcript = if transcript.is_empty() {
        "(no previous messages)".to_string()
    } else {
        transcript
    };

    let user = format!(
        "Available tasks:\n{tasks}\nRecent conversation:\n{transcript}\n\n\
         Query: {query}\n\n\
         Respond with JSON of the form \
         {{\"task\": \"<task name>\", \"params\": {{\"<name>\": \"<value>\"}}, \"confidence\": <0.0-1.0>}}. \
         Use \"chat\" when no other task fits."
    );

    Prompt::new(PromptPurpose::Classification, SYSTEM_PROMPT, user, query)
}

/// Parse the outermost `{...}` of a reply, ignoring code fences and prose.
fn parse_reply(reply: &str) -> Option<RawClassification> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

fn stringify_params(params: serde_json::Map<String, serde_json::Value>) -> BTreeMap<String, String> {
    params
        .into_iter()
        .filter_map(|(name, value)| {
            let value = match value {
                serde_json::Value::Null => return None,
                serde_json::Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            (!value.is_empty()).then_some((name, value))
        })
        .collect()
}
