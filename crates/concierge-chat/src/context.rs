//! Conversation context helpers.
//!
//! Renders the recent turn window for prompts and resolves follow-up
//! parameters (such as a location mentioned earlier) from prior turns.

use concierge_core::types::{Role, Turn};

/// Metadata key prefix under which classified parameters are recorded.
pub const PARAM_PREFIX: &str = "param.";

/// Metadata key holding the user query a system turn answered.
pub const QUERY_KEY: &str = "query";

pub fn param_key(name: &str) -> String {
    format!("{}{}", PARAM_PREFIX, name)
}

/// Render turns as a `User:` / `Assistant:` transcript, oldest first.
///
/// A system turn that recorded its query expands to both sides of the
/// exchange.
pub fn render_context(turns: &[Turn]) -> String {
    let mut lines = Vec::with_capacity(turns.len() * 2);
    for turn in turns {
        match turn.role {
            Role::User => lines.push(format!("User: {}", turn.text)),
            Role::System => {
                if let Some(query) = turn.metadata_value(QUERY_KEY) {
                    lines.push(format!("User: {}", query));
                }
                lines.push(format!("Assistant: {}", turn.text));
            }
        }
    }
    lines.join("\n")
}

/// The most recent non-blank value recorded for parameter `name`.
pub fn carried_parameter(turns: &[Turn], name: &str) -> Option<String> {
    let key = param_key(name);
    turns
        .iter()
        .rev()
        .filter_map(|turn| turn.metadata_value(&key))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}
