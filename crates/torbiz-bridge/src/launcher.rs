//! Spawning worker processes and reading their event stream.

use std::io;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use torbiz_core::request::encode_history;
use torbiz_core::{OperationRequest, ServeRequest, WorkerEvent};
use tracing::{debug, error, info, warn};

use crate::error::BridgeError;
use crate::handler::EventHandler;

/// How a worker invocation ended.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// The terminal event, if the worker wrote one.
    pub terminal: Option<WorkerEvent>,

    /// Process exit code, or -1 if it was killed by a signal.
    pub exit_code: i32,

    /// Whether the worker was stopped through [`WorkerHandle::stop`].
    pub stopped: bool,
}

impl WorkerOutcome {
    /// Returns true if the worker reported success.
    pub fn is_success(&self) -> bool {
        self.terminal.as_ref().is_some_and(WorkerEvent::is_success)
    }
}

/// Launches `torbiz-worker` processes.
///
/// Secrets (`hf_token`, node token) are handed to the worker through its
/// environment, never on the command line.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    /// Path to the worker executable.
    program: String,

    /// Arguments placed before the subcommand.
    args: Vec<String>,

    /// Additional environment variables.
    env_vars: Vec<(String, String)>,
}

impl WorkerLauncher {
    /// Create a launcher for the worker at `program` (PATH lookup if bare).
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
        }
    }

    /// Add a leading argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Render the worker arguments for a generation request.
    pub fn command_for(&self, request: &OperationRequest) -> Result<Vec<String>, BridgeError> {
        // Free text is joined to its flag so a leading '-' is never read as an option.
        let mut args = vec![
            "generate".to_string(),
            format!("--model-name={}", request.model),
            format!("--prompt={}", request.prompt),
            "--mode".to_string(),
            request.mode.to_string(),
            "--device".to_string(),
            request.device.to_string(),
            "--max-tokens".to_string(),
            request.max_tokens.to_string(),
            "--temperature".to_string(),
            request.temperature.to_string(),
            "--timeout".to_string(),
            request.connect_timeout.as_secs().to_string(),
            "--load-timeout".to_string(),
            request.load_timeout.as_secs().to_string(),
        ];
        if request.streaming {
            args.push("--stream".to_string());
        }
        if !request.history.is_empty() {
            args.push(format!(
                "--conversation-history={}",
                encode_history(&request.history)?
            ));
        }
        Ok(args)
    }

    /// Render the worker arguments for a serve request.
    pub fn serve_command_for(&self, request: &ServeRequest) -> Vec<String> {
        vec![
            "serve".to_string(),
            format!("--model-name={}", request.model),
            "--device".to_string(),
            request.device.to_string(),
            "--port".to_string(),
            request.port.to_string(),
        ]
    }

    /// Start a generation worker and forward its events to `handler`.
    pub fn spawn(
        &self,
        request: &OperationRequest,
        handler: Arc<dyn EventHandler>,
    ) -> Result<WorkerHandle, BridgeError> {
        let args = self.command_for(request)?;
        let mut secrets = Vec::new();
        if let Some(token) = &request.hf_token {
            secrets.push(("HF_TOKEN", token.as_str()));
        }
        info!(
            model = %request.model,
            mode = %request.mode,
            streaming = request.streaming,
            "Launching worker"
        );
        self.spawn_with(args, &secrets, handler)
    }

    /// Start a serve worker and forward its events to `handler`.
    pub fn spawn_serve(
        &self,
        request: &ServeRequest,
        handler: Arc<dyn EventHandler>,
    ) -> Result<WorkerHandle, BridgeError> {
        let args = self.serve_command_for(request);
        let mut secrets = vec![("TORBIZ_NODE_TOKEN", request.node_token.as_str())];
        if let Some(token) = &request.hf_token {
            secrets.push(("HF_TOKEN", token.as_str()));
        }
        info!(model = %request.model, port = request.port, "Launching block server");
        self.spawn_with(args, &secrets, handler)
    }

    fn spawn_with(
        &self,
        args: Vec<String>,
        secrets: &[(&str, &str)],
        handler: Arc<dyn EventHandler>,
    ) -> Result<WorkerHandle, BridgeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        for (key, value) in secrets {
            cmd.env(key, value);
        }

        debug!(program = %self.program, args = ?args, "Spawning worker");
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                BridgeError::WorkerNotFound(self.program.clone())
            } else {
                error!(error = %e, "Failed to spawn worker");
                BridgeError::SpawnError(e)
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::ProtocolError("Failed to get stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::ProtocolError("Failed to get stderr".to_string()))?;

        tokio::spawn(log_stderr(stderr));
        let reader = tokio::spawn(read_events(stdout, handler));

        Ok(WorkerHandle {
            child,
            reader: Some(reader),
            stopped: false,
        })
    }
}

impl Default for WorkerLauncher {
    fn default() -> Self {
        Self::new("torbiz-worker")
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    warn!(stderr = %trimmed, "Worker stderr");
                }
            }
            Err(e) => {
                error!(error = %e, "Error reading worker stderr");
                break;
            }
        }
    }
}

/// Forward every parsed line to `handler`; return the first terminal event.
async fn read_events(stdout: ChildStdout, handler: Arc<dyn EventHandler>) -> Option<WorkerEvent> {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    let mut terminal = None;
    let mut event_count = 0u64;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(total_events = event_count, "Worker stdout closed");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match WorkerEvent::from_line(trimmed) {
                    Ok(event) => {
                        event_count += 1;
                        if event.is_terminal() {
                            if terminal.is_some() {
                                warn!("Worker emitted more than one terminal event");
                            } else {
                                terminal = Some(event.clone());
                            }
                        }
                        if let Err(e) = handler.on_event(event).await {
                            warn!(error = %e, "Handler error processing event");
                        }
                    }
                    Err(e) => {
                        let preview: String = trimmed.chars().take(200).collect();
                        warn!(error = %e, preview = %preview, "Skipping unparseable worker output");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Error reading worker stdout");
                break;
            }
        }
    }
    terminal
}

/// A running worker process.
pub struct WorkerHandle {
    child: Child,
    reader: Option<JoinHandle<Option<WorkerEvent>>>,
    stopped: bool,
}

impl WorkerHandle {
    /// OS process id, while the worker is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the worker to exit and its output to be drained.
    pub async fn wait(mut self) -> Result<WorkerOutcome, BridgeError> {
        let status = self.child.wait().await?;
        let terminal = match self.reader.take() {
            Some(reader) => reader
                .await
                .map_err(|e| BridgeError::ProtocolError(format!("event reader failed: {}", e)))?,
            None => None,
        };
        let exit_code = status.code().unwrap_or(-1);
        info!(
            exit_code,
            stopped = self.stopped,
            has_result = terminal.is_some(),
            "Worker exited"
        );

        if terminal.is_none() && !status.success() && !self.stopped {
            return Err(BridgeError::ProcessError(format!(
                "worker exited with code {} without a result",
                exit_code
            )));
        }
        Ok(WorkerOutcome {
            terminal,
            exit_code,
            stopped: self.stopped,
        })
    }

    /// Kill the worker and reap it. A no-op if it already exited.
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        info!(pid = ?self.child.id(), "Stopping worker");
        self.stopped = true;
        self.child.kill().await?;
        Ok(())
    }
}
