//! Placeholder domain agents.
//!
//! The binary ships no real weather, events, SQL or image backends. These
//! stand-ins acknowledge the request with the parameters the classifier
//! extracted so the routing can be exercised end to end.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use concierge_chat::handler::REQUEST_PARAM;
use concierge_chat::{ExternalHandler, HandlerError, HandlerRegistry};
use concierge_core::types::TaskLabel;

/// A stub agent for one task label.
#[derive(Debug, Clone, Copy)]
pub struct StubAgent {
    label: TaskLabel,
}

impl StubAgent {
    pub fn new(label: TaskLabel) -> Self {
        Self { label }
    }

    fn describe(&self, parameters: &BTreeMap<String, String>) -> String {
        let param = |name: &str| parameters.get(name).map(String::as_str).unwrap_or("");
        match self.label {
            TaskLabel::Weather => format!(
                "The weather agent is not connected. I would fetch the forecast for {}.",
                param("location")
            ),
            TaskLabel::Events => format!(
                "The events agent is not connected. I would look up events in {}.",
                param("location")
            ),
            TaskLabel::Sql => format!(
                "The database agent is not connected. I would run a query for: {}",
                param("query")
            ),
            TaskLabel::ImageGeneration => {
                let prompt = parameters
                    .get("prompt")
                    .or_else(|| parameters.get(REQUEST_PARAM))
                    .map(String::as_str)
                    .unwrap_or("");
                format!("The image generator is not connected. I would draw: {}", prompt)
            }
            TaskLabel::Chat | TaskLabel::DocumentQa => {
                format!("No agent handles {} requests.", self.label)
            }
        }
    }
}

#[async_trait]
impl ExternalHandler for StubAgent {
    async fn run(&self, parameters: &BTreeMap<String, String>) -> Result<String, HandlerError> {
        debug!(task = %self.label, params = parameters.len(), "Stub agent invoked");
        Ok(self.describe(parameters))
    }
}

/// Register a stub for every domain agent task.
pub fn register_stub_agents(registry: &mut HandlerRegistry) {
    for label in [
        TaskLabel::Weather,
        TaskLabel::Events,
        TaskLabel::Sql,
        TaskLabel::ImageGeneration,
    ] {
        registry.register_external(label, std::sync::Arc::new(StubAgent::new(label)));
    }
}
