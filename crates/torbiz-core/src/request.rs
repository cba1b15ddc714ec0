//! Operation requests accepted by the worker.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Number of history entries (three exchanges) kept for prompt formatting.
pub const HISTORY_WINDOW: usize = 6;

/// Default number of tokens to generate.
pub const DEFAULT_MAX_TOKENS: u32 = 512;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Default deadline for joining the distributed network.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(500);

/// Default deadline for loading a local model.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Default port the network server listens on.
pub const DEFAULT_SERVE_PORT: u16 = 31337;

/// Where generation runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Model weights loaded into this process.
    #[default]
    Local,
    /// Blocks hosted by peers on the distributed network.
    Distributed,
}

impl Mode {
    /// Flag value used on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Distributed => "distributed",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "distributed" | "petals" => Ok(Self::Distributed),
            other => Err(CoreError::InvalidInput(format!("unknown mode '{}'", other))),
        }
    }
}

/// Compute device requested from the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Gpu,
    /// Let the engine pick.
    #[default]
    Auto,
}

impl Device {
    /// Flag value used on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" | "cuda" | "mps" => Ok(Self::Gpu),
            "auto" => Ok(Self::Auto),
            other => Err(CoreError::InvalidInput(format!("unknown device '{}'", other))),
        }
    }
}

/// Role of a message in the conversation history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    #[default]
    User,
    Assistant,
    System,
    /// Any role the prompt formatter does not know about.
    #[serde(other)]
    Other,
}

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: ChatRole,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    /// Create a new chat message.
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// Parse a JSON-encoded conversation history array.
///
/// Callers are expected to recover from an error by using an empty history.
pub fn parse_history(raw: &str) -> Result<Vec<ChatMessage>, CoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|e| CoreError::InvalidHistory(e.to_string()))
}

/// Serialize a history back to the JSON form accepted by [`parse_history`].
pub fn encode_history(history: &[ChatMessage]) -> Result<String, CoreError> {
    Ok(serde_json::to_string(history)?)
}

/// A single text generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub mode: Mode,
    pub device: Device,
    /// Model identifier (e.g. a HuggingFace repo id).
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub streaming: bool,
    pub history: Vec<ChatMessage>,
    /// Deadline for joining the network (distributed mode only).
    pub connect_timeout: Duration,
    /// Deadline for loading weights (local mode only).
    pub load_timeout: Duration,
    /// Opaque auth token passed through to the engine.
    pub hf_token: Option<String>,
}

impl OperationRequest {
    /// Create a request with default sampling parameters.
    pub fn new(mode: Mode, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            mode,
            device: Device::Auto,
            model: model.into(),
            prompt: prompt.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            streaming: false,
            history: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            hf_token: None,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn with_hf_token(mut self, token: impl Into<String>) -> Self {
        self.hf_token = Some(token.into());
        self
    }

    /// Check the request invariants before any phase starts.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.model.trim().is_empty() {
            return Err(CoreError::InvalidInput("model identifier is empty".into()));
        }
        if self.max_tokens == 0 {
            return Err(CoreError::InvalidInput("max_tokens must be at least 1".into()));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(CoreError::InvalidInput(format!(
                "temperature must be > 0, got {}",
                self.temperature
            )));
        }
        Ok(())
    }

    /// The history entries that take part in prompt formatting.
    pub fn recent_history(&self) -> &[ChatMessage] {
        let start = self.history.len().saturating_sub(HISTORY_WINDOW);
        &self.history[start..]
    }
}

/// A request to host model blocks for the distributed network.
#[derive(Debug, Clone, PartialEq)]
pub struct ServeRequest {
    pub model: String,
    pub node_token: String,
    pub device: Device,
    pub port: u16,
    pub hf_token: Option<String>,
}

impl ServeRequest {
    pub fn new(model: impl Into<String>, node_token: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            node_token: node_token.into(),
            device: Device::Auto,
            port: DEFAULT_SERVE_PORT,
            hf_token: None,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.model.trim().is_empty() {
            return Err(CoreError::InvalidInput("model identifier is empty".into()));
        }
        if self.node_token.trim().is_empty() {
            return Err(CoreError::InvalidInput("node token is empty".into()));
        }
        Ok(())
    }
}

/// Mask a secret for log output, keeping only its first and last 4 characters.
pub fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
