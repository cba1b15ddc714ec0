//! Core domain errors.

use thiserror::Error;

/// Core domain errors for the inference worker.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Conversation history could not be parsed.
    #[error("Invalid conversation history: {0}")]
    InvalidHistory(String),

    /// Engine output broke the stream contract.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
