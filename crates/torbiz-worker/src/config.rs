//! Worker configuration.

use std::time::Duration;

/// Program spoken to over the JSON-lines engine protocol when no
/// `--backend-cmd` is given.
pub const DEFAULT_BACKEND_PROGRAM: &str = "torbiz-backend";

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Heartbeat interval while a load or connect is pending.
    pub heartbeat_interval: Duration,

    /// Heartbeat interval while serving blocks.
    pub serve_heartbeat_interval: Duration,

    /// How long to wait for an engine call to wind down after shutdown.
    pub shutdown_grace: Duration,

    /// Engine backend executable.
    pub backend_program: String,

    /// Extra arguments passed to the engine backend.
    pub backend_args: Vec<String>,
}

impl Config {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_serve_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.serve_heartbeat_interval = interval;
        self
    }

    pub fn with_backend(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.backend_program = program.into();
        self.backend_args = args;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            serve_heartbeat_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            backend_program: DEFAULT_BACKEND_PROGRAM.to_string(),
            backend_args: Vec::new(),
        }
    }
}
