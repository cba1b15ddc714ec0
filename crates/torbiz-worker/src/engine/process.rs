//! Engine backed by an external process speaking JSON lines.
//!
//! Each request is one JSON object on the backend's stdin tagged by `op`;
//! the backend answers each with exactly one JSON object on stdout:
//!
//! ```text
//! -> {"op":"load","model":"...","device":"auto"}      <- {"ok":true}
//! -> {"op":"connect","model":"...","timeout_secs":500} <- {"ok":true}
//! -> {"op":"begin","prompt":"...",...}                 <- {"ok":true}
//! -> {"op":"step"}                                     <- {"text":"Hel"} | {"eos":true}
//! -> {"op":"generate","prompt":"...",...}              <- {"text":"..."}
//! -> {"op":"serve","model":"...",...}                  <- {"ok":true} when serving stops
//! any failure                                          <- {"error":"raw text"}
//! ```
//!
//! Lines on stdout that are not JSON are logged and skipped. The backend is
//! expected to exit when its stdin closes.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures::executor::block_on;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use torbiz_core::{Device, ServeRequest};
use tracing::{debug, error, info, warn};

use super::{EngineError, GenerationEngine, NetworkEngine, SamplingParams, Step};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Load {
        model: &'a str,
        device: Device,
    },
    Connect {
        model: &'a str,
        timeout_secs: u64,
    },
    Begin {
        prompt: &'a str,
        max_tokens: u32,
        temperature: f32,
        top_p: f32,
    },
    Step,
    Generate {
        prompt: &'a str,
        max_tokens: u32,
        temperature: f32,
        top_p: f32,
    },
    Serve {
        model: &'a str,
        node_token: &'a str,
        device: Device,
        port: u16,
    },
}

#[derive(Debug, Default, Deserialize)]
struct Reply {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    eos: bool,
    #[serde(default)]
    error: Option<String>,
}

/// A running backend process and its pipes.
struct Backend {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Backend {
    fn kill(child: &Mutex<Child>) {
        let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = child.kill() {
            debug!(error = %e, "Engine backend already gone");
        }
        let _ = child.wait();
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        Backend::kill(&self.child);
    }
}

/// Kills the backend if `cancel` fires while a call is pending.
///
/// The watcher thread sleeps until either the token fires or the guard is
/// dropped at the end of the call, whichever comes first.
struct KillOnCancel {
    _done: oneshot::Sender<()>,
}

impl KillOnCancel {
    fn watch(child: Arc<Mutex<Child>>, cancel: &CancellationToken) -> Self {
        let (done, finished) = oneshot::channel::<()>();
        let cancel = cancel.clone();
        let spawned = thread::Builder::new()
            .name("torbiz-backend-watch".to_string())
            .spawn(move || {
                block_on(async move {
                    tokio::select! {
                        biased;
                        _ = finished => {}
                        _ = cancel.cancelled() => {
                            info!("Cancellation requested; stopping engine backend");
                            Backend::kill(&child);
                        }
                    }
                })
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to start cancellation watcher; call is not cancellable");
        }
        Self { _done: done }
    }
}

/// Engine that delegates to a backend process.
///
/// The process is started lazily on the first call.
pub struct ProcessEngine {
    program: String,
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
    backend: Option<Backend>,
}

impl ProcessEngine {
    /// Create an engine for `program`, looked up on PATH if not a full path.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
            backend: None,
        }
    }

    /// Add a command-line argument for the backend.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several command-line arguments for the backend.
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    /// Add an environment variable for the backend.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    fn ensure_started(&mut self) -> Result<&mut Backend, EngineError> {
        if self.backend.is_none() {
            self.backend = Some(self.spawn()?);
        }
        self.backend
            .as_mut()
            .ok_or_else(|| EngineError::Protocol("engine backend not running".to_string()))
    }

    fn spawn(&self) -> Result<Backend, EngineError> {
        info!(program = %self.program, args = ?self.args, "Starting engine backend");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                EngineError::DependencyMissing(format!(
                    "engine backend '{}' not found; install it or pass --backend-cmd",
                    self.program
                ))
            } else {
                error!(error = %e, "Failed to spawn engine backend");
                EngineError::Io(e)
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("failed to get backend stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("failed to get backend stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Protocol("failed to get backend stderr".to_string()))?;

        thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            debug!(stderr = %trimmed, "Engine stderr");
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Error reading engine stderr");
                        break;
                    }
                }
            }
        });

        Ok(Backend {
            child: Arc::new(Mutex::new(child)),
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Send one request and read its reply.
    fn call(&mut self, request: &Request<'_>) -> Result<Reply, EngineError> {
        let backend = self.ensure_started()?;

        let mut line =
            serde_json::to_string(request).map_err(|e| EngineError::Protocol(e.to_string()))?;
        line.push('\n');
        backend.stdin.write_all(line.as_bytes())?;
        backend.stdin.flush()?;

        let mut buf = String::new();
        loop {
            buf.clear();
            if backend.stdout.read_line(&mut buf)? == 0 {
                return Err(EngineError::Backend(
                    "engine backend exited unexpectedly".to_string(),
                ));
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Reply>(trimmed) {
                Ok(reply) => {
                    return match reply.error {
                        Some(raw) => Err(EngineError::Backend(raw)),
                        None => Ok(reply),
                    };
                }
                Err(e) => {
                    let preview: String = trimmed.chars().take(200).collect();
                    warn!(error = %e, preview = %preview, "Skipping non-protocol engine output");
                }
            }
        }
    }

    /// Like [`ProcessEngine::call`], but kills the backend when `cancel` fires.
    fn call_cancellable(
        &mut self,
        request: &Request<'_>,
        cancel: &CancellationToken,
    ) -> Result<Reply, EngineError> {
        let child = self.ensure_started()?.child.clone();
        let _watch = KillOnCancel::watch(child, cancel);
        match self.call(request) {
            Err(_) if cancel.is_cancelled() => {
                self.backend = None;
                Err(EngineError::Cancelled)
            }
            other => other,
        }
    }
}

impl GenerationEngine for ProcessEngine {
    fn load(
        &mut self,
        model: &str,
        device: Device,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.call_cancellable(&Request::Load { model, device }, cancel)?;
        Ok(())
    }

    fn begin(&mut self, prompt: &str, params: &SamplingParams) -> Result<(), EngineError> {
        self.call(&Request::Begin {
            prompt,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        })?;
        Ok(())
    }

    fn generate_step(&mut self) -> Result<Step, EngineError> {
        let reply = self.call(&Request::Step)?;
        if reply.eos {
            return Ok(Step::Eos);
        }
        reply
            .text
            .map(Step::Snapshot)
            .ok_or_else(|| EngineError::Protocol("step reply has neither text nor eos".to_string()))
    }

    fn generate_all(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, EngineError> {
        let reply = self.call(&Request::Generate {
            prompt,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        })?;
        reply
            .text
            .ok_or_else(|| EngineError::Protocol("generate reply has no text".to_string()))
    }
}

impl NetworkEngine for ProcessEngine {
    fn connect(
        &mut self,
        model: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn GenerationEngine>, EngineError> {
        self.call_cancellable(
            &Request::Connect {
                model,
                timeout_secs: timeout.as_secs(),
            },
            cancel,
        )?;

        // The session keeps the connected backend.
        Ok(Box::new(ProcessEngine {
            program: self.program.clone(),
            args: self.args.clone(),
            env_vars: self.env_vars.clone(),
            backend: self.backend.take(),
        }))
    }

    fn serve(
        &mut self,
        request: &ServeRequest,
        shutdown: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.call_cancellable(
            &Request::Serve {
                model: &request.model,
                node_token: &request.node_token,
                device: request.device,
                port: request.port,
            },
            shutdown,
        )?;
        Ok(())
    }
}
