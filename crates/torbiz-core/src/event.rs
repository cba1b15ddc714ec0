//! Events written to the worker's stdout protocol, one JSON object per line.

use serde::{Deserialize, Serialize};

use crate::classify::ErrorCategory;
use crate::status::StatusTag;

/// Progress report emitted on every phase transition and heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: StatusTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    /// RFC 3339 emission time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl StatusEvent {
    /// Create a status event stamped with the current time.
    pub fn new(status: StatusTag) -> Self {
        Self {
            status,
            message: None,
            trace: None,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

/// Why a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The engine produced its end-of-sequence token.
    Eos,
    /// `max_tokens` was reached.
    Length,
}

/// One streamed text delta, or the end-of-stream marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEvent {
    pub token: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FinishReason>,
}

impl TokenEvent {
    /// A non-terminal text delta.
    pub fn delta(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            done: false,
            reason: None,
        }
    }

    /// The single terminal marker of a streaming session.
    pub fn finished(reason: FinishReason) -> Self {
        Self {
            token: String::new(),
            done: true,
            reason: Some(reason),
        }
    }
}

/// Complete response for non-streaming requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub text: String,
    pub done: bool,
}

impl FinalResult {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: true,
        }
    }
}

/// Terminal failure. The worker exits non-zero after emitting one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl ErrorEvent {
    /// Create an error event whose trace is the category's code.
    pub fn new(category: ErrorCategory, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            trace: Some(category.trace_code().to_string()),
        }
    }

    /// Category recovered from the trace code, if it is a known one.
    pub fn category(&self) -> Option<ErrorCategory> {
        self.trace.as_deref().and_then(ErrorCategory::from_trace_code)
    }
}

/// Any line of the worker's stdout protocol.
///
/// Shapes are distinguished by their fields, so the enum is untagged.
/// Variant order matters for deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerEvent {
    Error(ErrorEvent),
    Final(FinalResult),
    Token(TokenEvent),
    Status(StatusEvent),
}

impl WorkerEvent {
    /// Returns true if this event ends an invocation.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Error(_) | Self::Final(_) => true,
            Self::Token(token) => token.done,
            Self::Status(_) => false,
        }
    }

    /// Returns true for events that report success.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Final(_) => true,
            Self::Token(token) => token.done,
            Self::Error(_) | Self::Status(_) => false,
        }
    }

    /// Serialize to a single protocol line without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one protocol line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl From<StatusEvent> for WorkerEvent {
    fn from(event: StatusEvent) -> Self {
        Self::Status(event)
    }
}

impl From<TokenEvent> for WorkerEvent {
    fn from(event: TokenEvent) -> Self {
        Self::Token(event)
    }
}

impl From<FinalResult> for WorkerEvent {
    fn from(event: FinalResult) -> Self {
        Self::Final(event)
    }
}

impl From<ErrorEvent> for WorkerEvent {
    fn from(event: ErrorEvent) -> Self {
        Self::Error(event)
    }
}
