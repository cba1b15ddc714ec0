//! Torbiz Core Domain Types
//!
//! This crate contains the pure pieces of the inference worker with no
//! dependencies on:
//! - Child processes or threads
//! - The async runtime
//! - Any generation backend
//!
//! Everything here is shared by the worker binary and by hosts that read
//! the worker's stdout protocol.

pub mod classify;
pub mod diff;
pub mod error;
pub mod event;
pub mod ids;
pub mod prompt;
pub mod request;
pub mod status;

// Re-export commonly used types
pub use classify::{ErrorCategory, ErrorClassifier};
pub use diff::StreamDiffer;
pub use error::CoreError;
pub use event::{ErrorEvent, FinalResult, FinishReason, StatusEvent, TokenEvent, WorkerEvent};
pub use ids::RunId;
pub use request::{ChatMessage, ChatRole, Device, Mode, OperationRequest, ServeRequest};
pub use status::{StatusTag, WorkerState};
