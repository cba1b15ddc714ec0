//! Error types for the worker bridge.

use thiserror::Error;

/// Errors that can occur while launching or talking to a worker.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Worker executable not found.
    #[error("Worker binary not found at '{0}'. Ensure torbiz-worker is installed.")]
    WorkerNotFound(String),

    /// Failed to spawn or reap the worker process.
    #[error("Failed to run worker process: {0}")]
    SpawnError(#[from] std::io::Error),

    /// Worker exited abnormally without reporting a result.
    #[error("Worker process exited with error: {0}")]
    ProcessError(String),

    /// The request could not be rendered or the output could not be read.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The receiving side of a channel handler was dropped.
    #[error("Channel closed")]
    ChannelClosed,
}

impl From<torbiz_core::CoreError> for BridgeError {
    fn from(err: torbiz_core::CoreError) -> Self {
        Self::ProtocolError(err.to_string())
    }
}
