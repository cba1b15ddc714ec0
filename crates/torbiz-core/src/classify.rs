//! Classification of raw failure text into actionable error categories.
//!
//! Failures that cross the engine boundary arrive as plain text, so the
//! network categories are recovered by case-insensitive substring matching
//! in a fixed priority order. Classification is a pure function and never
//! fails: anything unrecognized becomes [`ErrorCategory::Unknown`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::ErrorEvent;

/// Maximum characters of raw error text quoted in a connection error.
const CONNECTION_DETAIL_CHARS: usize = 200;

/// Maximum characters of raw error text quoted in an unknown error.
const UNKNOWN_DETAIL_CHARS: usize = 300;

/// Error taxonomy of the worker. The trace code is the machine-readable
/// value written to the `trace` field of an error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Required engine or library is absent.
    DependencyMissing,
    /// Nobody hosts blocks for the requested model.
    NoBlocksHosted,
    /// The model is not served on the network.
    NoServersFound,
    /// The network did not answer in time.
    NetworkTimeout,
    /// Transport-level connection failure.
    ConnectionError,
    /// Local model load exceeded its deadline.
    ModelLoadTimeout,
    /// The engine returned data that violates the stream contract.
    ProtocolViolation,
    /// Failure while producing tokens.
    GenerationError,
    /// The request was rejected before any phase started.
    InvalidRequest,
    /// Stopped by a shutdown signal.
    Terminated,
    /// Anything else.
    Unknown,
}

/// Substring rules for network failures, highest priority first.
const RULES: &[(&[&str], ErrorCategory)] = &[
    (&["no blocks available"], ErrorCategory::NoBlocksHosted),
    (&["no servers", "could not find"], ErrorCategory::NoServersFound),
    (&["timeout"], ErrorCategory::NetworkTimeout),
    (&["connection"], ErrorCategory::ConnectionError),
];

impl ErrorCategory {
    /// Classify raw failure text.
    pub fn classify(raw: &str) -> Self {
        let lowered = raw.to_lowercase();
        RULES
            .iter()
            .find(|(needles, _)| needles.iter().any(|n| lowered.contains(n)))
            .map(|(_, category)| *category)
            .unwrap_or(Self::Unknown)
    }

    /// Stable machine-readable code.
    pub fn trace_code(&self) -> &'static str {
        match self {
            Self::DependencyMissing => "dependency_missing",
            Self::NoBlocksHosted => "no_blocks_hosted",
            Self::NoServersFound => "no_servers_found",
            Self::NetworkTimeout => "network_timeout",
            Self::ConnectionError => "connection_error",
            Self::ModelLoadTimeout => "model_load_timeout",
            Self::ProtocolViolation => "protocol_violation",
            Self::GenerationError => "generation_error",
            Self::InvalidRequest => "invalid_request",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
        }
    }

    /// Inverse of [`ErrorCategory::trace_code`].
    pub fn from_trace_code(code: &str) -> Option<Self> {
        const ALL: [ErrorCategory; 11] = [
            ErrorCategory::DependencyMissing,
            ErrorCategory::NoBlocksHosted,
            ErrorCategory::NoServersFound,
            ErrorCategory::NetworkTimeout,
            ErrorCategory::ConnectionError,
            ErrorCategory::ModelLoadTimeout,
            ErrorCategory::ProtocolViolation,
            ErrorCategory::GenerationError,
            ErrorCategory::InvalidRequest,
            ErrorCategory::Terminated,
            ErrorCategory::Unknown,
        ];
        ALL.into_iter().find(|c| c.trace_code() == code)
    }

    /// Exit code of a worker that ends with this category.
    ///
    /// A user-requested stop is a clean exit.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Terminated => 0,
            _ => 1,
        }
    }
}

/// Builds user-facing error events for one model.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    model: String,
}

impl ErrorClassifier {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    /// Classify raw failure text from the network engine.
    pub fn classify(&self, raw: &str) -> ErrorEvent {
        let category = ErrorCategory::classify(raw);
        self.event(category, raw)
    }

    /// Build the event for an already known category.
    pub fn event(&self, category: ErrorCategory, raw: &str) -> ErrorEvent {
        ErrorEvent::new(category, self.message(category, raw))
    }

    /// The deadline for joining the network elapsed.
    ///
    /// Worded as "we stopped waiting", since the connect may still be running.
    pub fn connect_timeout(&self, after: Duration) -> ErrorEvent {
        ErrorEvent::new(
            ErrorCategory::NetworkTimeout,
            format!(
                "Timeout: stopped waiting for {} after {} seconds. No blocks found for this model; \
                 no one may be hosting it or the network is slow.",
                self.model,
                after.as_secs()
            ),
        )
    }

    /// The deadline for loading local weights elapsed.
    pub fn load_timeout(&self, after: Duration) -> ErrorEvent {
        ErrorEvent::new(
            ErrorCategory::ModelLoadTimeout,
            format!(
                "Timeout: stopped waiting for {} to load after {} seconds.",
                self.model,
                after.as_secs()
            ),
        )
    }

    fn message(&self, category: ErrorCategory, raw: &str) -> String {
        match category {
            ErrorCategory::NoBlocksHosted => {
                format!("No blocks available: no one is hosting {}", self.model)
            }
            ErrorCategory::NoServersFound => {
                format!("No servers found: model {} is not on the network", self.model)
            }
            ErrorCategory::NetworkTimeout => "DHT timeout: network connection too slow".to_string(),
            ErrorCategory::ConnectionError => {
                format!("Connection error: {}", truncate(raw, CONNECTION_DETAIL_CHARS))
            }
            ErrorCategory::DependencyMissing => format!(
                "Inference backend not installed: {}",
                truncate(raw, CONNECTION_DETAIL_CHARS)
            ),
            ErrorCategory::ModelLoadTimeout => {
                format!("Timeout: {} did not finish loading", self.model)
            }
            ErrorCategory::ProtocolViolation => {
                format!("Engine protocol violation: {}", truncate(raw, CONNECTION_DETAIL_CHARS))
            }
            ErrorCategory::GenerationError => {
                format!("Generation failed: {}", truncate(raw, UNKNOWN_DETAIL_CHARS))
            }
            ErrorCategory::InvalidRequest => {
                format!("Invalid request: {}", truncate(raw, UNKNOWN_DETAIL_CHARS))
            }
            ErrorCategory::Terminated => "Worker terminated by shutdown signal".to_string(),
            ErrorCategory::Unknown => {
                format!("Unknown error: {}", truncate(raw, UNKNOWN_DETAIL_CHARS))
            }
        }
    }
}

/// Truncate to at most `max` characters without splitting a character.
fn truncate(raw: &str, max: usize) -> &str {
    match raw.char_indices().nth(max) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}
