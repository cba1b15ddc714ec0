//! Worker lifecycle state and the status tags reported on the protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a single worker invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Request received, nothing started yet.
    #[default]
    Initializing,
    /// Loading local model weights.
    LoadingModel,
    /// Joining the distributed network.
    Connecting,
    /// Producing tokens.
    Generating,
    /// Terminal success.
    Completed,
    /// A deadline elapsed before the phase resolved.
    TimedOut,
    /// A phase failed.
    Failed,
    /// Stopped by an external shutdown signal.
    Terminated,
}

impl WorkerState {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::TimedOut | Self::Failed | Self::Terminated
        )
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// States are never revisited. `Initializing -> Failed` covers requests
    /// rejected before any phase starts.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (*self, next) {
            (current, Terminated) => !current.is_terminal(),
            (Initializing, LoadingModel | Connecting | Failed) => true,
            (LoadingModel | Connecting, Generating | Failed | TimedOut) => true,
            (Generating, Completed | Failed) => true,
            _ => false,
        }
    }

    /// Validate and return the next state.
    pub fn transition(self, next: WorkerState) -> Result<WorkerState, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "INITIALIZING",
            Self::LoadingModel => "LOADING_MODEL",
            Self::Connecting => "CONNECTING",
            Self::Generating => "GENERATING",
            Self::Completed => "COMPLETED",
            Self::TimedOut => "TIMED_OUT",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// Tag carried in the `status` field of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTag {
    Initializing,
    LoadingModel,
    StillLoading,
    ModelLoaded,
    ConnectingToNetwork,
    StillConnecting,
    Connected,
    Generating,
    Serving,
    StillServing,
    ShuttingDown,
    /// A tag emitted by a newer worker.
    #[serde(other)]
    Other,
}

impl StatusTag {
    /// Heartbeat tag reported while `self` is pending.
    pub fn heartbeat(&self) -> Option<StatusTag> {
        match self {
            Self::LoadingModel => Some(Self::StillLoading),
            Self::ConnectingToNetwork => Some(Self::StillConnecting),
            Self::Serving => Some(Self::StillServing),
            _ => None,
        }
    }
}
