//! Request lifecycle state machine with validated transitions.
//!
//! Received -> Classified -> Dispatched -> Recorded -> Returned
//! Any non-terminal state -> Failed

use std::fmt;

use serde::Serialize;

use crate::error::RouterError;

/// Where a routed request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Classified,
    Dispatched,
    Recorded,
    Returned,
    Failed,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Received => "received",
            RequestState::Classified => "classified",
            RequestState::Dispatched => "dispatched",
            RequestState::Recorded => "recorded",
            RequestState::Returned => "returned",
            RequestState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Returned | RequestState::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate that a state transition is allowed.
///
/// Valid transitions:
/// - Received -> Classified
/// - Classified -> Dispatched
/// - Dispatched -> Recorded
/// - Dispatched -> Returned (the turn could not be written)
/// - Recorded -> Returned
/// - any non-terminal state -> Failed
pub fn validate_transition(from: RequestState, to: RequestState) -> Result<(), RouterError> {
    let valid = matches!(
        (from, to),
        (RequestState::Received, RequestState::Classified)
            | (RequestState::Classified, RequestState::Dispatched)
            | (RequestState::Dispatched, RequestState::Recorded)
            | (RequestState::Dispatched, RequestState::Returned)
            | (RequestState::Recorded, RequestState::Returned)
    ) || (to == RequestState::Failed && !from.is_terminal());

    if valid {
        Ok(())
    } else {
        Err(RouterError::InvalidTransition(from, to))
    }
}

/// The states one request has visited, in order.
#[derive(Debug, Clone)]
pub(crate) struct Lifecycle {
    trace: Vec<RequestState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            trace: vec![RequestState::Received],
        }
    }

    pub(crate) fn current(&self) -> RequestState {
        self.trace
            .last()
            .copied()
            .unwrap_or(RequestState::Received)
    }

    pub(crate) fn advance(&mut self, to: RequestState) -> Result<(), RouterError> {
        validate_transition(self.current(), to)?;
        self.trace.push(to);
        Ok(())
    }

    pub(crate) fn into_trace(self) -> Vec<RequestState> {
        self.trace
    }
}
