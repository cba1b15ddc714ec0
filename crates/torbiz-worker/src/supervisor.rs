//! Drives one worker invocation through its lifecycle.
//!
//! The supervisor owns the [`WorkerState`] machine. Blocking engine phases
//! run through the [`CancellableInvoker`] with a heartbeat attached, and
//! every invocation ends with exactly one terminal event on the emitter,
//! even if the supervisor itself unwinds.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use torbiz_core::prompt::{format_chat_prompt, strip_prompt_echo};
use torbiz_core::{
    ErrorCategory, ErrorClassifier, ErrorEvent, FinalResult, FinishReason, OperationRequest,
    RunId, StatusEvent, StatusTag, StreamDiffer, TokenEvent, WorkerEvent, WorkerState,
};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::emitter::EventEmitter;
use crate::engine::{EngineError, GenerationEngine, NetworkEngine, SamplingParams, Step, Strategy};
use crate::heartbeat::{HeartbeatHandle, HeartbeatMonitor};
use crate::invoker::{CancellableInvoker, InvokeError};

/// Steps buffered between the generation thread and the supervisor.
const STREAM_BUFFER: usize = 32;

/// How an invocation ended when it did not succeed.
#[derive(Debug)]
pub(crate) struct Failure {
    state: WorkerState,
    event: ErrorEvent,
}

impl Failure {
    pub(crate) fn failed(event: ErrorEvent) -> Self {
        Self {
            state: WorkerState::Failed,
            event,
        }
    }

    fn timed_out(event: ErrorEvent) -> Self {
        Self {
            state: WorkerState::TimedOut,
            event,
        }
    }

    pub(crate) fn terminated(classifier: &ErrorClassifier) -> Self {
        Self {
            state: WorkerState::Terminated,
            event: classifier.event(ErrorCategory::Terminated, ""),
        }
    }
}

/// Emits a fallback error if the invocation ends without a terminal event.
pub(crate) struct TerminalGuard {
    emitter: Arc<EventEmitter>,
}

impl TerminalGuard {
    pub(crate) fn new(emitter: Arc<EventEmitter>) -> Self {
        Self { emitter }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if self.emitter.terminal_emitted() {
            return;
        }
        error!("Invocation ended without a terminal event");
        let event = ErrorEvent::new(ErrorCategory::Unknown, "Worker exited without a result");
        if let Err(e) = self.emitter.emit(event) {
            error!(error = %e, "Failed to emit fallback terminal event");
        }
    }
}

/// Supervises a single generate or serve invocation.
pub struct WorkerSupervisor {
    pub(crate) emitter: Arc<EventEmitter>,
    pub(crate) config: Config,
    pub(crate) shutdown: CancellationToken,
    pub(crate) state: WorkerState,
    pub(crate) run_id: RunId,
}

impl WorkerSupervisor {
    pub fn new(emitter: Arc<EventEmitter>, config: Config, shutdown: CancellationToken) -> Self {
        Self {
            emitter,
            config,
            shutdown,
            state: WorkerState::Initializing,
            run_id: RunId::generate(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run a generation request to completion and return the exit code.
    pub async fn run(&mut self, request: OperationRequest, strategy: Strategy) -> i32 {
        let _guard = TerminalGuard::new(self.emitter.clone());
        let classifier = ErrorClassifier::new(&request.model);

        info!(
            run_id = %self.run_id.short(),
            model = %request.model,
            mode = %strategy.mode(),
            streaming = request.streaming,
            history_len = request.history.len(),
            "Starting generation"
        );
        if strategy.mode() != request.mode {
            warn!(requested = %request.mode, engine = %strategy.mode(), "Engine mode differs from request");
        }

        match self.drive(&request, strategy, &classifier).await {
            Ok(()) => match self.advance(WorkerState::Completed) {
                Ok(()) => {
                    info!(run_id = %self.run_id.short(), "Generation complete");
                    0
                }
                Err(failure) => self.fail(failure),
            },
            Err(failure) => self.fail(failure),
        }
    }

    async fn drive(
        &mut self,
        request: &OperationRequest,
        strategy: Strategy,
        classifier: &ErrorClassifier,
    ) -> Result<(), Failure> {
        self.emit(
            StatusEvent::new(StatusTag::Initializing)
                .with_message(format!(
                    "Starting {} inference for {}",
                    strategy.mode(),
                    request.model
                ))
                .with_trace("init"),
        );

        request.validate().map_err(|e| {
            Failure::failed(classifier.event(ErrorCategory::InvalidRequest, &e.to_string()))
        })?;
        if self.shutdown.is_cancelled() {
            return Err(Failure::terminated(classifier));
        }

        let engine = match strategy {
            Strategy::Local(engine) => self.load(request, engine, classifier).await?,
            Strategy::Distributed(network) => self.connect(request, network, classifier).await?,
        };

        self.generate(request, engine, classifier).await
    }

    async fn load(
        &mut self,
        request: &OperationRequest,
        mut engine: Box<dyn GenerationEngine>,
        classifier: &ErrorClassifier,
    ) -> Result<Box<dyn GenerationEngine>, Failure> {
        self.advance(WorkerState::LoadingModel)?;
        self.emit(
            StatusEvent::new(StatusTag::LoadingModel)
                .with_message(format!("Loading {} on {}...", request.model, request.device))
                .with_trace("load_start"),
        );

        let model = request.model.clone();
        let device = request.device;
        let loaded = self
            .run_phase(
                StatusTag::LoadingModel,
                Some(request.load_timeout),
                self.config.heartbeat_interval,
                move |cancel| {
                    engine.load(&model, device, &cancel)?;
                    Ok(engine)
                },
            )
            .await
            .map_err(|e| phase_failure(e, classifier, |after| classifier.load_timeout(after)))?;

        self.emit(
            StatusEvent::new(StatusTag::ModelLoaded)
                .with_message(format!("{} loaded", request.model))
                .with_trace("load_complete"),
        );
        Ok(loaded)
    }

    async fn connect(
        &mut self,
        request: &OperationRequest,
        mut network: Box<dyn NetworkEngine>,
        classifier: &ErrorClassifier,
    ) -> Result<Box<dyn GenerationEngine>, Failure> {
        self.advance(WorkerState::Connecting)?;
        self.emit(
            StatusEvent::new(StatusTag::ConnectingToNetwork)
                .with_message(format!(
                    "Searching the network for blocks of {}...",
                    request.model
                ))
                .with_trace("connect_start"),
        );

        let model = request.model.clone();
        let timeout = request.connect_timeout;
        let session = self
            .run_phase(
                StatusTag::ConnectingToNetwork,
                Some(timeout),
                self.config.heartbeat_interval,
                move |cancel| network.connect(&model, timeout, &cancel),
            )
            .await
            .map_err(|e| phase_failure(e, classifier, |after| classifier.connect_timeout(after)))?;

        self.emit(
            StatusEvent::new(StatusTag::Connected)
                .with_message("Connected to the distributed network")
                .with_trace("connect_complete"),
        );
        Ok(session)
    }

    async fn generate(
        &mut self,
        request: &OperationRequest,
        engine: Box<dyn GenerationEngine>,
        classifier: &ErrorClassifier,
    ) -> Result<(), Failure> {
        self.advance(WorkerState::Generating)?;
        self.emit(
            StatusEvent::new(StatusTag::Generating)
                .with_message("Generating response...")
                .with_trace("generate_start"),
        );

        // Only the fallback layout is limited to the recent window.
        let prompt = engine
            .chat_template(&request.history, &request.prompt)
            .unwrap_or_else(|| format_chat_prompt(request.recent_history(), &request.prompt));
        let params = SamplingParams::from_request(request);
        debug!(prompt_len = prompt.len(), max_tokens = params.max_tokens, "Prompt ready");

        if request.streaming {
            self.stream(engine, prompt, params, classifier).await
        } else {
            self.complete(engine, prompt, params, classifier).await
        }
    }

    /// Non-streaming generation: one call, one final result.
    async fn complete(
        &mut self,
        mut engine: Box<dyn GenerationEngine>,
        prompt: String,
        params: SamplingParams,
        classifier: &ErrorClassifier,
    ) -> Result<(), Failure> {
        let call_prompt = prompt.clone();
        let text = CancellableInvoker::new("generate")
            .with_parent(&self.shutdown)
            .with_grace(self.config.shutdown_grace)
            .invoke(move |_| engine.generate_all(&call_prompt, &params))
            .await
            .map_err(|e| generation_failure(e, classifier))?;

        let text = strip_prompt_echo(&text, &prompt);
        debug!(chars = text.chars().count(), "Generation finished");
        self.emit(FinalResult::new(text));
        Ok(())
    }

    /// Streaming generation: one delta per growing snapshot, then a done marker.
    async fn stream(
        &mut self,
        engine: Box<dyn GenerationEngine>,
        prompt: String,
        params: SamplingParams,
        classifier: &ErrorClassifier,
    ) -> Result<(), Failure> {
        let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
        let producer_cancel = self.shutdown.child_token();
        let _stop_producer = producer_cancel.clone().drop_guard();
        let max_tokens = params.max_tokens;

        std::thread::Builder::new()
            .name("torbiz-stream".to_string())
            .spawn(move || produce_steps(engine, &prompt, &params, &tx, &producer_cancel))
            .map_err(|e| {
                Failure::failed(classifier.event(ErrorCategory::GenerationError, &e.to_string()))
            })?;

        let mut differ = StreamDiffer::new();
        let mut steps: u32 = 0;
        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(Failure::terminated(classifier)),
                next = rx.recv() => next,
            };
            match next {
                Some(Ok(Step::Snapshot(text))) => {
                    steps += 1;
                    let delta = differ.next_delta(&text).map_err(|e| {
                        Failure::failed(
                            classifier.event(ErrorCategory::ProtocolViolation, &e.to_string()),
                        )
                    })?;
                    if !delta.is_empty() {
                        self.emit(TokenEvent::delta(delta));
                    }
                }
                Some(Ok(Step::Eos)) => break FinishReason::Eos,
                Some(Err(e)) => return Err(generation_failure(InvokeError::Failed(e), classifier)),
                None if steps >= max_tokens => break FinishReason::Length,
                None => {
                    return Err(Failure::failed(classifier.event(
                        ErrorCategory::GenerationError,
                        "generation stopped before the end of the sequence",
                    )))
                }
            }
        };

        debug!(steps, reason = ?reason, chars = differ.emitted_len(), "Stream finished");
        self.emit(TokenEvent::finished(reason));
        Ok(())
    }

    /// Run a blocking engine call with a heartbeat for `tag`.
    pub(crate) async fn run_phase<T, F>(
        &self,
        tag: StatusTag,
        deadline: Option<Duration>,
        interval: Duration,
        op: F,
    ) -> Result<T, InvokeError<EngineError>>
    where
        F: FnOnce(CancellationToken) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let heartbeat = self.start_heartbeat(tag, interval);

        let mut invoker = CancellableInvoker::new(phase_label(tag))
            .with_parent(&self.shutdown)
            .with_grace(self.config.shutdown_grace);
        if let Some(deadline) = deadline {
            invoker = invoker.with_deadline(deadline);
        }
        let result = invoker.invoke(op).await;

        if let Some(heartbeat) = heartbeat {
            let ticks = heartbeat.stop();
            debug!(phase = phase_label(tag), ticks, "Phase resolved");
        }
        result
    }

    fn start_heartbeat(&self, tag: StatusTag, interval: Duration) -> Option<HeartbeatHandle> {
        let beat = tag.heartbeat()?;
        let label = phase_label(tag);
        let emitter = self.emitter.clone();
        Some(HeartbeatMonitor::start(interval, move |_, elapsed| {
            let secs = elapsed.as_secs();
            let event = StatusEvent::new(beat)
                .with_message(heartbeat_message(beat, secs))
                .with_trace(format!("{}_waiting_{}s", label, secs));
            if let Err(e) = emitter.emit(event) {
                debug!(error = %e, "Heartbeat not emitted");
            }
        }))
    }

    pub(crate) fn advance(&mut self, next: WorkerState) -> Result<(), Failure> {
        match self.state.transition(next) {
            Ok(state) => {
                debug!(from = %self.state, to = %state, "State transition");
                self.state = state;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Rejected state transition");
                Err(Failure::failed(ErrorEvent::new(
                    ErrorCategory::Unknown,
                    e.to_string(),
                )))
            }
        }
    }

    /// Record the failure, emit its terminal event and return the exit code.
    pub(crate) fn fail(&mut self, failure: Failure) -> i32 {
        match self.state.transition(failure.state) {
            Ok(state) => self.state = state,
            Err(e) => warn!(error = %e, "Keeping current state"),
        }

        let code = failure
            .event
            .category()
            .map(|c| c.exit_code())
            .unwrap_or(1);

        if failure.state == WorkerState::Terminated {
            info!(run_id = %self.run_id.short(), "Shutdown requested; stopping");
            self.emit(
                StatusEvent::new(StatusTag::ShuttingDown)
                    .with_message("Shutting down...")
                    .with_trace("shutdown"),
            );
        } else {
            error!(
                run_id = %self.run_id.short(),
                state = %self.state,
                trace = failure.event.trace.as_deref().unwrap_or("unknown"),
                error = %failure.event.error,
                "Invocation failed"
            );
        }

        self.emit(failure.event);
        code
    }

    pub(crate) fn emit(&self, event: impl Into<WorkerEvent>) {
        if let Err(e) = self.emitter.emit(event) {
            warn!(error = %e, "Failed to emit event");
        }
    }
}

/// Feed engine steps to the supervisor until EOS, an error, or `max_tokens`.
fn produce_steps(
    mut engine: Box<dyn GenerationEngine>,
    prompt: &str,
    params: &SamplingParams,
    tx: &mpsc::Sender<Result<Step, EngineError>>,
    cancel: &CancellationToken,
) {
    if let Err(e) = engine.begin(prompt, params) {
        let _ = tx.blocking_send(Err(e));
        return;
    }
    for _ in 0..params.max_tokens {
        if cancel.is_cancelled() {
            return;
        }
        let step = engine.generate_step();
        let last = !matches!(step, Ok(Step::Snapshot(_)));
        if tx.blocking_send(step).is_err() || last {
            return;
        }
    }
}

/// Map a failed load, connect or serve call to its terminal outcome.
pub(crate) fn phase_failure(
    err: InvokeError<EngineError>,
    classifier: &ErrorClassifier,
    on_timeout: impl FnOnce(Duration) -> ErrorEvent,
) -> Failure {
    match err {
        InvokeError::TimedOut(after) => Failure::timed_out(on_timeout(after)),
        InvokeError::Cancelled | InvokeError::Failed(EngineError::Cancelled) => {
            Failure::terminated(classifier)
        }
        InvokeError::Failed(e) => Failure::failed(classifier.event(e.category(), &e.raw_text())),
        InvokeError::Panicked(msg) => Failure::failed(classifier.event(ErrorCategory::Unknown, &msg)),
        InvokeError::Spawn(e) => {
            Failure::failed(classifier.event(ErrorCategory::Unknown, &e.to_string()))
        }
    }
}

/// Like [`phase_failure`], but unrecognized engine text is a generation error.
fn generation_failure(err: InvokeError<EngineError>, classifier: &ErrorClassifier) -> Failure {
    match err {
        InvokeError::Failed(e) if e.category() == ErrorCategory::Unknown => Failure::failed(
            classifier.event(ErrorCategory::GenerationError, &e.raw_text()),
        ),
        InvokeError::Panicked(msg) => {
            Failure::failed(classifier.event(ErrorCategory::GenerationError, &msg))
        }
        other => phase_failure(other, classifier, |after| {
            classifier.event(
                ErrorCategory::GenerationError,
                &format!("generation exceeded {}s", after.as_secs()),
            )
        }),
    }
}

fn phase_label(tag: StatusTag) -> &'static str {
    match tag {
        StatusTag::LoadingModel => "load",
        StatusTag::ConnectingToNetwork => "connect",
        StatusTag::Serving => "serve",
        _ => "phase",
    }
}

fn heartbeat_message(beat: StatusTag, secs: u64) -> String {
    match beat {
        StatusTag::StillLoading => format!("Still loading model... ({}s)", secs),
        StatusTag::StillConnecting => format!("Still searching for blocks... ({}s)", secs),
        StatusTag::StillServing => format!("Serving blocks ({}s uptime)", secs),
        _ => format!("Still working... ({}s)", secs),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use torbiz_core::{ChatMessage, Device, Mode, ServeRequest};

    use crate::emitter::MemorySink;

    /// Block the calling engine thread until `cancel` fires.
    pub(crate) fn hang_until(cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Engine that replays canned results.
    #[derive(Default)]
    pub(crate) struct ScriptedEngine {
        load_error: Option<EngineError>,
        hang_on_load: bool,
        steps: VecDeque<Result<Step, EngineError>>,
        full_reply: Option<String>,
        echo_prompt: bool,
        seen_prompt: Arc<Mutex<Option<String>>>,
        generate_error: Option<EngineError>,
        /// Delay before `generate_all` returns.
        slow_reply: Option<Duration>,
        /// Produce an endless stream, one snapshot per delay.
        slow_steps: Option<Duration>,
        produced: usize,
        has_template: bool,
    }

    impl ScriptedEngine {
        fn replying(text: &str) -> Self {
            Self {
                full_reply: Some(text.to_string()),
                ..Default::default()
            }
        }

        fn snapshots(steps: &[&str], eos: bool) -> Self {
            let mut queue: VecDeque<_> = steps
                .iter()
                .map(|s| Ok(Step::Snapshot(s.to_string())))
                .collect();
            if eos {
                queue.push_back(Ok(Step::Eos));
            }
            Self {
                steps: queue,
                ..Default::default()
            }
        }
    }

    impl GenerationEngine for ScriptedEngine {
        fn load(
            &mut self,
            _model: &str,
            _device: Device,
            cancel: &CancellationToken,
        ) -> Result<(), EngineError> {
            if self.hang_on_load {
                hang_until(cancel);
                return Err(EngineError::Cancelled);
            }
            match self.load_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn chat_template(&self, history: &[ChatMessage], prompt: &str) -> Option<String> {
            self.has_template
                .then(|| format!("[template with {} turns] {}", history.len(), prompt))
        }

        fn begin(&mut self, prompt: &str, _params: &SamplingParams) -> Result<(), EngineError> {
            *self.seen_prompt.lock().unwrap() = Some(prompt.to_string());
            Ok(())
        }

        fn generate_step(&mut self) -> Result<Step, EngineError> {
            if let Some(delay) = self.slow_steps {
                std::thread::sleep(delay);
                self.produced += 1;
                return Ok(Step::Snapshot("a".repeat(self.produced)));
            }
            self.steps
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::Backend("script exhausted".into())))
        }

        fn generate_all(
            &mut self,
            prompt: &str,
            _params: &SamplingParams,
        ) -> Result<String, EngineError> {
            *self.seen_prompt.lock().unwrap() = Some(prompt.to_string());
            if let Some(delay) = self.slow_reply {
                std::thread::sleep(delay);
            }
            if let Some(e) = self.generate_error.take() {
                return Err(e);
            }
            let reply = self.full_reply.clone().unwrap_or_default();
            if self.echo_prompt {
                Ok(format!("{}{}", prompt, reply))
            } else {
                Ok(reply)
            }
        }
    }

    /// Network that either hangs, fails, or hands out a scripted session.
    pub(crate) enum ScriptedNetwork {
        Hang,
        Fail(String),
        Session(Option<ScriptedEngine>),
        ServeUntilShutdown,
        ServeReturns,
    }

    impl NetworkEngine for ScriptedNetwork {
        fn connect(
            &mut self,
            _model: &str,
            _timeout: Duration,
            cancel: &CancellationToken,
        ) -> Result<Box<dyn GenerationEngine>, EngineError> {
            match self {
                Self::Fail(raw) => Err(EngineError::Backend(raw.clone())),
                Self::Session(engine) => match engine.take() {
                    Some(engine) => Ok(Box::new(engine)),
                    None => Err(EngineError::Backend("session already taken".into())),
                },
                _ => {
                    hang_until(cancel);
                    Err(EngineError::Cancelled)
                }
            }
        }

        fn serve(
            &mut self,
            _request: &ServeRequest,
            shutdown: &CancellationToken,
        ) -> Result<(), EngineError> {
            match self {
                Self::Fail(raw) => Err(EngineError::Backend(raw.clone())),
                Self::ServeReturns => Ok(()),
                _ => {
                    hang_until(shutdown);
                    Err(EngineError::Cancelled)
                }
            }
        }
    }

    pub(crate) fn supervisor(config: Config) -> (WorkerSupervisor, MemorySink, CancellationToken) {
        let sink = MemorySink::default();
        let shutdown = CancellationToken::new();
        let supervisor = WorkerSupervisor::new(
            Arc::new(EventEmitter::new(sink.clone())),
            config,
            shutdown.clone(),
        );
        (supervisor, sink, shutdown)
    }

    fn quiet_config() -> Config {
        Config::default().with_heartbeat_interval(Duration::from_secs(3600))
    }

    pub(crate) fn terminal_count(events: &[WorkerEvent]) -> usize {
        events.iter().filter(|e| e.is_terminal()).count()
    }

    fn statuses(events: &[WorkerEvent]) -> Vec<StatusTag> {
        events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Status(s) => Some(s.status),
                _ => None,
            })
            .collect()
    }

    fn tokens(events: &[WorkerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Token(t) if !t.done => Some(t.token.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_local_non_streaming_final_result() {
        let (mut sup, sink, _) = supervisor(quiet_config());
        let mut engine = ScriptedEngine::replying("Hi there");
        engine.echo_prompt = true;
        let request = OperationRequest::new(Mode::Local, "TinyLlama/TinyLlama-1.1B-Chat-v1.0", "Hello");

        let code = sup.run(request, Strategy::Local(Box::new(engine))).await;

        assert_eq!(code, 0);
        assert_eq!(sup.state(), WorkerState::Completed);
        let events = sink.events();
        assert_eq!(
            statuses(&events),
            vec![
                StatusTag::Initializing,
                StatusTag::LoadingModel,
                StatusTag::ModelLoaded,
                StatusTag::Generating
            ]
        );
        assert_eq!(sink.lines().last().unwrap(), r#"{"text":"Hi there","done":true}"#);
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_streaming_deltas_concatenate_to_final_text() {
        let (mut sup, sink, _) = supervisor(quiet_config());
        let engine = ScriptedEngine::snapshots(&["Hel", "Hello", "Hello", "Hello, wörld", "Hello, wörld!"], true);
        let request = OperationRequest::new(Mode::Local, "m", "Hi").with_streaming(true);

        let code = sup.run(request, Strategy::Local(Box::new(engine))).await;

        assert_eq!(code, 0);
        let events = sink.events();
        let deltas = tokens(&events);
        assert_eq!(deltas, vec!["Hel", "lo", ", wörld", "!"]);
        assert_eq!(deltas.concat(), "Hello, wörld!");
        assert_eq!(
            sink.lines().last().unwrap(),
            r#"{"token":"","done":true,"reason":"eos"}"#
        );
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_streaming_eos_first_emits_no_tokens() {
        let (mut sup, sink, _) = supervisor(quiet_config());
        let engine = ScriptedEngine::snapshots(&[], true);
        let request = OperationRequest::new(Mode::Local, "m", "Hi").with_streaming(true);

        assert_eq!(sup.run(request, Strategy::Local(Box::new(engine))).await, 0);
        let events = sink.events();
        assert!(tokens(&events).is_empty());
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Token(t)) if t.done && t.reason == Some(FinishReason::Eos)
        ));
    }

    #[tokio::test]
    async fn test_streaming_stops_at_max_tokens() {
        let (mut sup, sink, _) = supervisor(quiet_config());
        let engine = ScriptedEngine::snapshots(&["a", "ab", "abc", "abcd"], true);
        let request = OperationRequest::new(Mode::Local, "m", "Hi")
            .with_streaming(true)
            .with_max_tokens(2);

        assert_eq!(sup.run(request, Strategy::Local(Box::new(engine))).await, 0);
        let events = sink.events();
        assert_eq!(tokens(&events), vec!["a", "b"]);
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Token(t)) if t.reason == Some(FinishReason::Length)
        ));
    }

    #[tokio::test]
    async fn test_shrinking_snapshot_is_protocol_violation() {
        let (mut sup, sink, _) = supervisor(quiet_config());
        let engine = ScriptedEngine::snapshots(&["Hello", "Hel"], true);
        let request = OperationRequest::new(Mode::Local, "m", "Hi").with_streaming(true);

        assert_eq!(sup.run(request, Strategy::Local(Box::new(engine))).await, 1);
        assert_eq!(sup.state(), WorkerState::Failed);
        let events = sink.events();
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Error(e)) if e.category() == Some(ErrorCategory::ProtocolViolation)
        ));
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_engine_error_mid_stream_is_generation_error() {
        let (mut sup, sink, _) = supervisor(quiet_config());
        let mut engine = ScriptedEngine::snapshots(&["Hel"], false);
        engine
            .steps
            .push_back(Err(EngineError::Backend("CUDA out of memory".into())));
        let request = OperationRequest::new(Mode::Local, "m", "Hi").with_streaming(true);

        assert_eq!(sup.run(request, Strategy::Local(Box::new(engine))).await, 1);
        let events = sink.events();
        assert_eq!(tokens(&events), vec!["Hel"]);
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Error(e)) if e.category() == Some(ErrorCategory::GenerationError)
        ));
    }

    #[tokio::test]
    async fn test_history_window_reaches_prompt() {
        let (mut sup, _sink, _) = supervisor(quiet_config());
        let engine = ScriptedEngine::replying("ok");
        let seen = engine.seen_prompt.clone();
        let history: Vec<_> = (0..8)
            .map(|i| ChatMessage::user(format!("msg{}", i)))
            .collect();
        let request = OperationRequest::new(Mode::Local, "m", "latest").with_history(history);

        assert_eq!(sup.run(request, Strategy::Local(Box::new(engine))).await, 0);
        let prompt = seen.lock().unwrap().clone().unwrap();
        assert!(!prompt.contains("msg1<"));
        assert!(prompt.contains("msg2</s>"));
        assert!(prompt.ends_with("<|user|>\nlatest</s>\n<|assistant|>\n"));
    }

    #[tokio::test]
    async fn test_chat_template_sees_full_history() {
        let (mut sup, _sink, _) = supervisor(quiet_config());
        let mut engine = ScriptedEngine::replying("ok");
        engine.has_template = true;
        let seen = engine.seen_prompt.clone();
        let history: Vec<_> = (0..8)
            .map(|i| ChatMessage::user(format!("msg{}", i)))
            .collect();
        let request = OperationRequest::new(Mode::Local, "m", "latest").with_history(history);

        assert_eq!(sup.run(request, Strategy::Local(Box::new(engine))).await, 0);
        let prompt = seen.lock().unwrap().clone().unwrap();
        assert_eq!(prompt, "[template with 8 turns] latest");
    }

    #[tokio::test]
    async fn test_invalid_request_fails_before_any_phase() {
        let (mut sup, sink, _) = supervisor(quiet_config());
        let request = OperationRequest::new(Mode::Local, "m", "Hi").with_temperature(0.0);

        let code = sup
            .run(request, Strategy::Local(Box::new(ScriptedEngine::default())))
            .await;

        assert_eq!(code, 1);
        assert_eq!(sup.state(), WorkerState::Failed);
        let events = sink.events();
        assert_eq!(statuses(&events), vec![StatusTag::Initializing]);
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Error(e)) if e.trace.as_deref() == Some("invalid_request")
        ));
    }

    #[tokio::test]
    async fn test_missing_dependency() {
        let (mut sup, sink, _) = supervisor(quiet_config());
        let engine = ScriptedEngine {
            load_error: Some(EngineError::DependencyMissing("torch".into())),
            ..Default::default()
        };
        let request = OperationRequest::new(Mode::Local, "m", "Hi");

        assert_eq!(sup.run(request, Strategy::Local(Box::new(engine))).await, 1);
        assert!(matches!(
            sink.events().last(),
            Some(WorkerEvent::Error(e)) if e.trace.as_deref() == Some("dependency_missing")
        ));
    }

    #[tokio::test]
    async fn test_distributed_generation_through_session() {
        let (mut sup, sink, _) = supervisor(quiet_config());
        let network = ScriptedNetwork::Session(Some(ScriptedEngine::replying("Paris")));
        let request = OperationRequest::new(Mode::Distributed, "bigscience/bloom-560m", "Capital of France?");

        assert_eq!(sup.run(request, Strategy::Distributed(Box::new(network))).await, 0);
        let events = sink.events();
        assert_eq!(
            statuses(&events),
            vec![
                StatusTag::Initializing,
                StatusTag::ConnectingToNetwork,
                StatusTag::Connected,
                StatusTag::Generating
            ]
        );
        assert!(matches!(events.last(), Some(WorkerEvent::Final(f)) if f.text == "Paris"));
    }

    #[tokio::test]
    async fn test_no_blocks_hosted() {
        let (mut sup, sink, _) = supervisor(quiet_config());
        let network = ScriptedNetwork::Fail("No blocks available for this model".into());
        let request = OperationRequest::new(Mode::Distributed, "meta-llama/Llama-2-70b", "Hi");

        assert_eq!(sup.run(request, Strategy::Distributed(Box::new(network))).await, 1);
        assert_eq!(sup.state(), WorkerState::Failed);
        let events = sink.events();
        match events.last() {
            Some(WorkerEvent::Error(e)) => {
                assert_eq!(e.trace.as_deref(), Some("no_blocks_hosted"));
                assert!(e.error.contains("meta-llama/Llama-2-70b"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_with_one_heartbeat() {
        let config = Config::default().with_heartbeat_interval(Duration::from_secs(5));
        let (mut sup, sink, _) = supervisor(config);
        let request = OperationRequest::new(Mode::Distributed, "m", "Hi")
            .with_connect_timeout(Duration::from_secs(5));

        let code = sup
            .run(request, Strategy::Distributed(Box::new(ScriptedNetwork::Hang)))
            .await;

        assert_eq!(code, 1);
        assert_eq!(sup.state(), WorkerState::TimedOut);
        let events = sink.events();
        assert_eq!(
            statuses(&events),
            vec![
                StatusTag::Initializing,
                StatusTag::ConnectingToNetwork,
                StatusTag::StillConnecting
            ]
        );
        match &events[2] {
            WorkerEvent::Status(s) => assert_eq!(s.trace.as_deref(), Some("connect_waiting_5s")),
            other => panic!("expected heartbeat, got {:?}", other),
        }
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Error(e)) if e.trace.as_deref() == Some("network_timeout")
        ));
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_timeout_heartbeats() {
        let config = Config::default().with_heartbeat_interval(Duration::from_secs(5));
        let (mut sup, sink, _) = supervisor(config);
        let engine = ScriptedEngine {
            hang_on_load: true,
            ..Default::default()
        };
        let request = OperationRequest::new(Mode::Local, "m", "Hi")
            .with_load_timeout(Duration::from_secs(23));

        assert_eq!(sup.run(request, Strategy::Local(Box::new(engine))).await, 1);
        assert_eq!(sup.state(), WorkerState::TimedOut);
        let events = sink.events();
        let beats = statuses(&events)
            .into_iter()
            .filter(|t| *t == StatusTag::StillLoading)
            .count();
        assert_eq!(beats, 4);
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Error(e)) if e.trace.as_deref() == Some("model_load_timeout")
        ));
    }

    #[tokio::test]
    async fn test_shutdown_during_load_is_clean_exit() {
        let (mut sup, sink, shutdown) = supervisor(quiet_config());
        let engine = ScriptedEngine {
            hang_on_load: true,
            ..Default::default()
        };
        let request = OperationRequest::new(Mode::Local, "m", "Hi");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });

        let code = sup.run(request, Strategy::Local(Box::new(engine))).await;

        assert_eq!(code, 0);
        assert_eq!(sup.state(), WorkerState::Terminated);
        let events = sink.events();
        assert!(statuses(&events).contains(&StatusTag::ShuttingDown));
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Error(e)) if e.trace.as_deref() == Some("terminated")
        ));
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_engine_error_without_streaming_is_generation_error() {
        let (mut sup, sink, _) = supervisor(quiet_config());
        let engine = ScriptedEngine {
            generate_error: Some(EngineError::Backend("CUDA out of memory".into())),
            ..Default::default()
        };
        let request = OperationRequest::new(Mode::Local, "m", "Hi");

        assert_eq!(sup.run(request, Strategy::Local(Box::new(engine))).await, 1);
        assert_eq!(sup.state(), WorkerState::Failed);
        let events = sink.events();
        match events.last() {
            Some(WorkerEvent::Error(e)) => {
                assert_eq!(e.trace.as_deref(), Some("generation_error"));
                assert!(e.error.contains("CUDA out of memory"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_streaming_is_clean_exit() {
        let (mut sup, sink, shutdown) = supervisor(quiet_config());
        let engine = ScriptedEngine {
            slow_steps: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let request = OperationRequest::new(Mode::Local, "m", "Hi")
            .with_streaming(true)
            .with_max_tokens(10_000);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        });

        let code = sup.run(request, Strategy::Local(Box::new(engine))).await;

        assert_eq!(code, 0);
        assert_eq!(sup.state(), WorkerState::Terminated);
        let events = sink.events();
        assert!(statuses(&events).contains(&StatusTag::ShuttingDown));
        assert!(!events
            .iter()
            .any(|e| matches!(e, WorkerEvent::Token(t) if t.done)));
        assert_eq!(
            sink.lines().last().unwrap(),
            r#"{"error":"Worker terminated by shutdown signal","trace":"terminated"}"#
        );
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_generating_without_streaming() {
        let mut config = quiet_config();
        config.shutdown_grace = Duration::from_millis(20);
        let (mut sup, sink, shutdown) = supervisor(config);
        let engine = ScriptedEngine {
            full_reply: Some("too late".into()),
            slow_reply: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        let request = OperationRequest::new(Mode::Local, "m", "Hi");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });

        let code = sup.run(request, Strategy::Local(Box::new(engine))).await;

        assert_eq!(code, 0);
        assert_eq!(sup.state(), WorkerState::Terminated);
        let events = sink.events();
        assert!(!events.iter().any(|e| matches!(e, WorkerEvent::Final(_))));
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Error(e)) if e.trace.as_deref() == Some("terminated")
        ));
        assert_eq!(terminal_count(&events), 1);
    }

    #[test]
    fn test_guard_emits_fallback_terminal() {
        let sink = MemorySink::default();
        let emitter = Arc::new(EventEmitter::new(sink.clone()));
        drop(TerminalGuard::new(emitter.clone()));

        let events = sink.events();
        assert_eq!(terminal_count(&events), 1);
        assert!(matches!(
            &events[0],
            WorkerEvent::Error(e) if e.trace.as_deref() == Some("unknown")
        ));

        // A second guard finds the terminal already written.
        drop(TerminalGuard::new(emitter));
        assert_eq!(sink.events().len(), 1);
    }
}
