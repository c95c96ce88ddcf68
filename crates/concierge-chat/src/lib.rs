//! Concierge chat crate - intent classification and request routing.
//!
//! The [`Router`] classifies each query with the [`TaskClassifier`],
//! dispatches it to the handler registered for the resulting task, records
//! one turn in the conversation store and returns the answer. Document
//! questions are answered by the [`DocumentQaEngine`] from retrieved
//! excerpts; other domains plug in through [`ExternalHandler`].

pub mod classifier;
pub mod context;
pub mod error;
pub mod handler;
pub mod inference;
pub mod lifecycle;
pub mod qa;
pub mod router;

pub use classifier::TaskClassifier;
pub use error::{ClassifyError, HandlerError, InferenceError, QaError, RouterError};
pub use handler::{ChatHandler, ExternalHandler, HandlerRegistry, TaskHandler, TaskRequest};
pub use inference::{
    inference_from_config, CompletionConstraints, InferenceClient, InferenceService,
    OfflineInference, OpenAiCompatibleInference, Prompt, PromptPurpose, ScriptedInference,
};
pub use lifecycle::{validate_transition, RequestState};
pub use qa::DocumentQaEngine;
pub use router::{RoutedAnswer, Router, MAX_QUERY_CHARS};
