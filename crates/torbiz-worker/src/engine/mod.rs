//! Inference engines the supervisor drives.
//!
//! Both capabilities are blocking, synchronous calls. The supervisor never
//! calls them on the async runtime; they run on threads owned by
//! [`crate::invoker::CancellableInvoker`] or the streaming loop.

mod process;

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use torbiz_core::{ChatMessage, Device, ErrorCategory, Mode, OperationRequest, ServeRequest};

pub use process::ProcessEngine;

/// Errors surfaced by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine or one of its libraries is not installed.
    #[error("Inference backend not available: {0}")]
    DependencyMissing(String),

    /// Failure text reported by the engine itself.
    #[error("{0}")]
    Backend(String),

    /// The engine answered with something outside its protocol.
    #[error("Engine protocol error: {0}")]
    Protocol(String),

    /// The call observed cancellation and stopped.
    #[error("Engine call cancelled")]
    Cancelled,

    /// Transport error while talking to the engine.
    #[error("I/O error talking to engine: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Category for a failure while loading or connecting.
    ///
    /// Engine-reported text is classified by its wording.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DependencyMissing(_) => ErrorCategory::DependencyMissing,
            Self::Protocol(_) => ErrorCategory::ProtocolViolation,
            Self::Cancelled => ErrorCategory::Terminated,
            Self::Backend(raw) => ErrorCategory::classify(raw),
            Self::Io(e) => ErrorCategory::classify(&e.to_string()),
        }
    }

    /// Raw text handed to the classifier.
    pub fn raw_text(&self) -> String {
        match self {
            Self::Backend(raw) | Self::DependencyMissing(raw) | Self::Protocol(raw) => raw.clone(),
            other => other.to_string(),
        }
    }
}

/// Sampling parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl SamplingParams {
    pub fn from_request(request: &OperationRequest) -> Self {
        Self {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: 0.9,
        }
    }
}

/// Outcome of one incremental generation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Full decoded text generated so far (prompt excluded).
    Snapshot(String),
    /// The engine sampled its end-of-sequence token.
    Eos,
}

/// A loaded model that can produce text.
pub trait GenerationEngine: Send {
    /// Load weights for `model` on `device`. May block for minutes.
    fn load(
        &mut self,
        model: &str,
        device: Device,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    /// Render the prompt with the model's own chat template, if it has one.
    fn chat_template(&self, _history: &[ChatMessage], _prompt: &str) -> Option<String> {
        None
    }

    /// Start an incremental generation for `prompt`.
    fn begin(&mut self, prompt: &str, params: &SamplingParams) -> Result<(), EngineError>;

    /// Produce the next token and return the full text so far.
    fn generate_step(&mut self) -> Result<Step, EngineError>;

    /// Generate a complete response in one call.
    ///
    /// The returned text may start with an echo of `prompt`.
    fn generate_all(&mut self, prompt: &str, params: &SamplingParams)
        -> Result<String, EngineError>;
}

/// Access to the distributed network.
pub trait NetworkEngine: Send {
    /// Join the network and return a session that generates through it.
    ///
    /// `timeout` is advisory; the supervisor enforces its own deadline.
    fn connect(
        &mut self,
        model: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn GenerationEngine>, EngineError>;

    /// Host blocks of a model until `shutdown` is cancelled.
    fn serve(
        &mut self,
        request: &ServeRequest,
        shutdown: &CancellationToken,
    ) -> Result<(), EngineError>;
}

/// How a generation request obtains its engine.
pub enum Strategy {
    /// Load the model into this process.
    Local(Box<dyn GenerationEngine>),
    /// Generate through peers on the network.
    Distributed(Box<dyn NetworkEngine>),
}

impl Strategy {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Local(_) => Mode::Local,
            Self::Distributed(_) => Mode::Distributed,
        }
    }
}
