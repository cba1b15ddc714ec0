//! Run a blocking engine call with a deadline the caller can walk away from.
//!
//! Engine calls (weight loading, network bootstrap) block the calling thread
//! and cannot be interrupted. The invoker runs each call on a dedicated OS
//! thread and awaits its result through a oneshot channel, so the supervisor
//! stays responsive to deadlines and shutdown. On abandonment the call keeps
//! running in the background; it gets a cancelled token to stop cooperatively
//! and its result is discarded.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why an invocation produced no value.
#[derive(Debug, Error)]
pub enum InvokeError<E> {
    /// The deadline elapsed first. The call was abandoned.
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    /// The parent token was cancelled first. The call was abandoned.
    #[error("Cancelled")]
    Cancelled,

    /// The call returned an error.
    #[error("{0}")]
    Failed(E),

    /// The call panicked or its thread vanished without a result.
    #[error("Engine call panicked: {0}")]
    Panicked(String),

    /// No thread could be started for the call.
    #[error("Failed to start engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Runs blocking calls on their own thread with an optional deadline.
#[derive(Debug, Clone)]
pub struct CancellableInvoker {
    label: String,
    deadline: Option<Duration>,
    parent: Option<CancellationToken>,
    grace: Duration,
}

impl CancellableInvoker {
    /// Create an invoker. `label` names the thread and log lines.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            deadline: None,
            parent: None,
            grace: Duration::ZERO,
        }
    }

    /// Abandon the call once `deadline` has elapsed.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Abandon the call when `parent` is cancelled.
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// After a parent cancellation, wait up to `grace` for the call to
    /// return before abandoning it.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run `op` and wait for its outcome.
    ///
    /// The token handed to `op` is cancelled whenever the caller stops
    /// waiting.
    pub async fn invoke<T, E, F>(&self, op: F) -> Result<T, InvokeError<E>>
    where
        F: FnOnce(CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let token = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (tx, mut rx) = oneshot::channel();

        let op_token = token.clone();
        std::thread::Builder::new()
            .name(format!("torbiz-{}", self.label))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| op(op_token)));
                // The receiver is gone if the call was abandoned.
                let _ = tx.send(outcome);
            })
            .map_err(InvokeError::Spawn)?;

        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        let parent_cancelled = async {
            match &self.parent {
                Some(parent) => parent.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let received = tokio::select! {
            biased;
            received = &mut rx => received,
            _ = parent_cancelled => {
                token.cancel();
                if !self.grace.is_zero()
                    && tokio::time::timeout(self.grace, &mut rx).await.is_ok()
                {
                    debug!(label = %self.label, "Engine call wound down after shutdown");
                } else {
                    warn!(label = %self.label, "Abandoning engine call after shutdown");
                }
                return Err(InvokeError::Cancelled);
            }
            _ = deadline => {
                token.cancel();
                let after = self.deadline.unwrap_or_default();
                warn!(
                    label = %self.label,
                    after_secs = after.as_secs(),
                    "Deadline elapsed; abandoning engine call"
                );
                return Err(InvokeError::TimedOut(after));
            }
        };

        match received {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(InvokeError::Failed(e)),
            Ok(Err(payload)) => Err(InvokeError::Panicked(panic_message(payload))),
            Err(_) => Err(InvokeError::Panicked(
                "engine thread exited without a result".to_string(),
            )),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
