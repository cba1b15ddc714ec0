//! Torbiz inference worker.
//!
//! Runs one generation (or serves blocks) per process and reports progress
//! as JSON lines on stdout. Diagnostics go to stderr.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use torbiz_core::request::{
    parse_history, DEFAULT_CONNECT_TIMEOUT, DEFAULT_LOAD_TIMEOUT, DEFAULT_MAX_TOKENS,
    DEFAULT_SERVE_PORT, DEFAULT_TEMPERATURE,
};
use torbiz_core::{ChatMessage, Device, ErrorCategory, ErrorEvent, Mode, OperationRequest, ServeRequest};

mod config;
mod emitter;
mod engine;
mod heartbeat;
mod invoker;
mod serve;
mod supervisor;

use config::{Config, DEFAULT_BACKEND_PROGRAM};
use emitter::EventEmitter;
use engine::{ProcessEngine, Strategy};
use supervisor::WorkerSupervisor;

/// Torbiz worker - local and distributed LLM inference
#[derive(Parser, Debug)]
#[command(name = "torbiz-worker")]
#[command(about = "Run one inference request and stream JSON-lines events", long_about = None)]
struct Cli {
    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a response for one prompt
    Generate(GenerateArgs),

    /// Host model blocks for the distributed network until stopped
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct BackendArgs {
    /// Engine backend executable
    #[arg(long, default_value = DEFAULT_BACKEND_PROGRAM)]
    backend_cmd: String,

    /// Extra argument for the engine backend (repeatable)
    #[arg(long = "backend-arg", allow_hyphen_values = true)]
    backend_args: Vec<String>,

    /// HuggingFace token passed to the backend
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Model identifier
    #[arg(long, allow_hyphen_values = true)]
    model_name: String,

    /// User prompt
    #[arg(long, allow_hyphen_values = true)]
    prompt: String,

    /// Where to run: local or distributed
    #[arg(long, default_value = "local")]
    mode: Mode,

    /// Compute device: cpu, gpu or auto
    #[arg(long, default_value = "auto")]
    device: Device,

    /// Maximum tokens to generate
    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    max_tokens: u32,

    /// Sampling temperature
    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    temperature: f32,

    /// Stream token deltas instead of one final result
    #[arg(long)]
    stream: bool,

    /// Conversation history as a JSON array of {role, content}
    #[arg(long, default_value = "[]", allow_hyphen_values = true)]
    conversation_history: String,

    /// Seconds to wait for the network (distributed mode)
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.as_secs())]
    timeout: u64,

    /// Seconds to wait for weights to load (local mode)
    #[arg(long, default_value_t = DEFAULT_LOAD_TIMEOUT.as_secs())]
    load_timeout: u64,

    /// Seconds between progress heartbeats
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_interval: u64,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Model identifier
    #[arg(long, allow_hyphen_values = true)]
    model_name: String,

    /// Node token identifying this host to the network
    #[arg(long, env = "TORBIZ_NODE_TOKEN", hide_env_values = true)]
    node_token: String,

    /// Compute device: cpu, gpu or auto
    #[arg(long, default_value = "auto")]
    device: Device,

    /// Port the block server listens on
    #[arg(long, default_value_t = DEFAULT_SERVE_PORT)]
    port: u16,

    /// Seconds between uptime heartbeats
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_interval: u64,

    #[command(flatten)]
    backend: BackendArgs,
}

/// Engine backend process for this invocation.
fn backend_engine(config: &Config, hf_token: Option<&str>) -> ProcessEngine {
    let engine =
        ProcessEngine::new(&config.backend_program).with_args(config.backend_args.clone());
    match hf_token {
        Some(token) => engine.with_env("HF_TOKEN", token),
        None => engine,
    }
}

/// Parse the history flag, falling back to an empty history.
fn history_from_flag(raw: &str) -> Vec<ChatMessage> {
    match parse_history(raw) {
        Ok(history) => history,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed conversation history");
            Vec::new()
        }
    }
}

fn generate_request(args: &GenerateArgs) -> OperationRequest {
    let request = OperationRequest::new(args.mode, &args.model_name, &args.prompt)
        .with_device(args.device)
        .with_max_tokens(args.max_tokens)
        .with_temperature(args.temperature)
        .with_streaming(args.stream)
        .with_history(history_from_flag(&args.conversation_history))
        .with_connect_timeout(Duration::from_secs(args.timeout))
        .with_load_timeout(Duration::from_secs(args.load_timeout));
    match &args.backend.hf_token {
        Some(token) => request.with_hf_token(token),
        None => request,
    }
}

fn serve_request(args: &ServeArgs) -> ServeRequest {
    let mut request = ServeRequest::new(&args.model_name, &args.node_token);
    request.device = args.device;
    request.port = args.port;
    request.hf_token = args.backend.hf_token.clone();
    request
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "warn,torbiz_worker=debug,torbiz_core=debug"
    } else {
        "warn,torbiz_worker=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Cancel `token` on Ctrl+C or SIGTERM.
fn watch_signals(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                        _ = term.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable; listening for Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received Ctrl+C");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
        }
        token.cancel();
    });
}

async fn run(cli: Cli, emitter: Arc<EventEmitter>) -> i32 {
    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone());

    match cli.command {
        Commands::Generate(args) => {
            let config = Config::default()
                .with_heartbeat_interval(Duration::from_secs(args.heartbeat_interval))
                .with_backend(&args.backend.backend_cmd, args.backend.backend_args.clone());
            let request = generate_request(&args);
            let engine = backend_engine(&config, args.backend.hf_token.as_deref());
            let strategy = match request.mode {
                Mode::Local => Strategy::Local(Box::new(engine)),
                Mode::Distributed => Strategy::Distributed(Box::new(engine)),
            };
            info!(backend = %config.backend_program, "Using engine backend");

            let mut supervisor = WorkerSupervisor::new(emitter, config, shutdown);
            supervisor.run(request, strategy).await
        }
        Commands::Serve(args) => {
            let config = Config::default()
                .with_serve_heartbeat_interval(Duration::from_secs(args.heartbeat_interval))
                .with_backend(&args.backend.backend_cmd, args.backend.backend_args.clone());
            let request = serve_request(&args);
            let network = Box::new(backend_engine(&config, args.backend.hf_token.as_deref()));
            info!(backend = %config.backend_program, "Using engine backend");

            let mut supervisor = WorkerSupervisor::new(emitter, config, shutdown);
            supervisor.serve(request, network).await
        }
    }
}

/// A panic that escapes the supervisor still ends the process with exit 1.
fn exit_code(outcome: std::thread::Result<i32>) -> i32 {
    match outcome {
        Ok(code) => code,
        Err(_) => {
            error!("Worker panicked");
            1
        }
    }
}

fn main() {
    let emitter = Arc::new(EventEmitter::stdout());

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => {
            // --help and --version
            let _ = e.print();
            std::process::exit(0);
        }
        Err(e) => {
            let _ = e.print();
            let rendered = e.to_string();
            let reason = rendered
                .lines()
                .next()
                .unwrap_or("invalid arguments")
                .trim_start_matches("error: ");
            let _ = emitter.emit(ErrorEvent::new(
                ErrorCategory::InvalidRequest,
                format!("Invalid request: {}", reason),
            ));
            std::process::exit(1);
        }
    };

    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            let _ = emitter.emit(ErrorEvent::new(
                ErrorCategory::Unknown,
                format!("Unknown error: {}", e),
            ));
            std::process::exit(1);
        }
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(run(cli, emitter))));
    let code = exit_code(outcome);

    // Abandoned engine threads must not hold the process open.
    runtime.shutdown_background();
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_flags() {
        let cli = Cli::try_parse_from([
            "torbiz-worker",
            "generate",
            "--model-name",
            "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
            "--prompt",
            "Hello",
            "--mode",
            "distributed",
            "--stream",
            "--max-tokens",
            "64",
            "--backend-arg",
            "--quantize",
        ])
        .unwrap();

        let Commands::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let request = generate_request(&args);
        assert_eq!(request.mode, Mode::Distributed);
        assert!(request.streaming);
        assert_eq!(request.max_tokens, 64);
        assert_eq!(request.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(args.backend.backend_cmd, DEFAULT_BACKEND_PROGRAM);
        assert_eq!(args.backend.backend_args, vec!["--quantize"]);
    }

    #[test]
    fn test_malformed_history_falls_back_to_empty() {
        assert!(history_from_flag("{not json").is_empty());
        assert!(history_from_flag("").is_empty());
        assert_eq!(
            history_from_flag(r#"[{"role":"user","content":"Hi"}]"#),
            vec![ChatMessage::user("Hi")]
        );
    }

    #[test]
    fn test_serve_flags() {
        let cli = Cli::try_parse_from([
            "torbiz-worker",
            "--verbose",
            "serve",
            "--model-name",
            "bigscience/bloom-560m",
            "--node-token",
            "abc123",
            "--device",
            "cuda",
        ])
        .unwrap();

        assert!(cli.verbose);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let request = serve_request(&args);
        assert_eq!(request.port, DEFAULT_SERVE_PORT);
        assert_eq!(request.device, Device::Gpu);
        assert_eq!(args.heartbeat_interval, 60);
    }

    #[test]
    fn test_hyphen_leading_prompt_is_accepted() {
        for argv in [
            vec![
                "torbiz-worker",
                "generate",
                "--model-name",
                "m",
                "--prompt",
                "-5 degrees outside, what should I wear?",
            ],
            vec![
                "torbiz-worker",
                "generate",
                "--model-name=m",
                "--prompt=-5 degrees outside, what should I wear?",
                "--conversation-history=[]",
            ],
        ] {
            let cli = Cli::try_parse_from(argv).unwrap();
            let Commands::Generate(args) = cli.command else {
                panic!("expected generate");
            };
            assert_eq!(args.prompt, "-5 degrees outside, what should I wear?");
            assert_eq!(args.model_name, "m");
        }

        let cli = Cli::try_parse_from([
            "torbiz-worker",
            "generate",
            "--model-name",
            "m",
            "--prompt",
            "- first\n- second",
            "--stream",
        ])
        .unwrap();
        let Commands::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.prompt, "- first\n- second");
        assert!(args.stream);
    }

    #[test]
    fn test_panic_maps_to_failure_exit_code() {
        let outcome = panic::catch_unwind(|| -> i32 { panic!("supervisor bug") });
        assert_eq!(exit_code(outcome), 1);
        assert_eq!(exit_code(Ok(0)), 0);
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let result = Cli::try_parse_from([
            "torbiz-worker",
            "generate",
            "--model-name",
            "m",
            "--prompt",
            "p",
            "--heartbeat-interval",
            "0",
        ]);
        assert!(result.is_err());
    }
}
