//! Error types for classification, answering and routing.

use concierge_core::types::TaskLabel;
use concierge_vector::VectorError;

use crate::lifecycle::RequestState;

/// Errors from an inference call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InferenceError {
    #[error("inference service unavailable: {0}")]
    Unavailable(String),
    #[error("inference timed out after {0} ms")]
    Timeout(u64),
    #[error("inference request rejected: {0}")]
    Rejected(String),
    #[error("invalid inference response: {0}")]
    InvalidResponse(String),
}

impl InferenceError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, InferenceError::Unavailable(_) | InferenceError::Timeout(_))
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        InferenceError::Unavailable(err.to_string())
    }
}

/// Errors from the task classifier.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("classification unavailable: {0}")]
    ClassificationUnavailable(#[from] InferenceError),
}

/// Errors from the document QA engine.
#[derive(Debug, thiserror::Error)]
pub enum QaError {
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] VectorError),
    #[error("answer synthesis failed: {0}")]
    Inference(#[from] InferenceError),
}

/// Errors from a task handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("missing required parameter: {0}")]
    MissingParameter(String),
    #[error("handler timed out after {0} ms")]
    Timeout(u64),
}

impl From<QaError> for HandlerError {
    fn from(err: QaError) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

impl From<InferenceError> for HandlerError {
    fn from(err: InferenceError) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

/// Errors that fail a routed request outright.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no handler registered for task: {0}")]
    UnregisteredTask(TaskLabel),
    #[error("invalid request state transition: {0} -> {1}")]
    InvalidTransition(RequestState, RequestState),
    #[error("invalid conversation id: {0:?}")]
    InvalidConversation(String),
}
