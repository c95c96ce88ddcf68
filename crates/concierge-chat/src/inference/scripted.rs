//! Deterministic, closure-driven inference for tests and offline demos.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CompletionConstraints, InferenceService, Prompt};
use crate::error::InferenceError;

type Script = dyn Fn(&Prompt) -> Result<String, InferenceError> + Send + Sync;

/// Replies by calling a closure with each prompt.
///
/// Every prompt is recorded so callers can inspect what was sent.
pub struct ScriptedInference {
    script: Box<Script>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedInference {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&Prompt) -> Result<String, InferenceError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always reply with `text`.
    pub fn replying(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(text.clone()))
    }

    /// Always fail with `err`.
    pub fn failing(err: InferenceError) -> Self {
        Self::new(move |_| Err(err.clone()))
    }

    /// Sleep before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls made so far, including ones that timed out.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        _constraints: &CompletionConstraints,
    ) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(prompt)
    }
}

impl std::fmt::Debug for ScriptedInference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedInference")
            .field("delay", &self.delay)
            .field("calls", &self.calls())
            .finish()
    }
}
