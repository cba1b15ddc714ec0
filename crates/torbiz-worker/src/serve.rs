//! Hosting model blocks for the distributed network.
//!
//! A serve invocation never succeeds: it runs until a shutdown signal
//! (clean exit) or until the network engine fails.

use torbiz_core::request::redact;
use torbiz_core::{ErrorCategory, ErrorClassifier, ServeRequest, StatusEvent, StatusTag, WorkerState};
use tracing::info;

use crate::engine::NetworkEngine;
use crate::supervisor::{phase_failure, Failure, TerminalGuard, WorkerSupervisor};

impl WorkerSupervisor {
    /// Serve blocks until shutdown and return the exit code.
    pub async fn serve(&mut self, request: ServeRequest, network: Box<dyn NetworkEngine>) -> i32 {
        let _guard = TerminalGuard::new(self.emitter.clone());
        let classifier = ErrorClassifier::new(&request.model);

        info!(
            run_id = %self.run_id.short(),
            model = %request.model,
            port = request.port,
            device = %request.device,
            node_token = %redact(&request.node_token),
            "Starting block server"
        );

        let failure = self.host(request, network, &classifier).await;
        self.fail(failure)
    }

    async fn host(
        &mut self,
        request: ServeRequest,
        mut network: Box<dyn NetworkEngine>,
        classifier: &ErrorClassifier,
    ) -> Failure {
        self.emit(
            StatusEvent::new(StatusTag::Initializing)
                .with_message(format!("Preparing to serve {}", request.model))
                .with_trace("init"),
        );

        if let Err(e) = request.validate() {
            return Failure::failed(classifier.event(ErrorCategory::InvalidRequest, &e.to_string()));
        }
        if self.shutdown.is_cancelled() {
            return Failure::terminated(classifier);
        }
        if let Err(failure) = self.advance(WorkerState::Connecting) {
            return failure;
        }

        self.emit(
            StatusEvent::new(StatusTag::Serving)
                .with_message(format!(
                    "Serving {} blocks on port {}",
                    request.model, request.port
                ))
                .with_trace("serve_start"),
        );

        let result = self
            .run_phase(
                StatusTag::Serving,
                None,
                self.config.serve_heartbeat_interval,
                move |shutdown| network.serve(&request, &shutdown),
            )
            .await;

        match result {
            Ok(()) => Failure::failed(classifier.event(
                ErrorCategory::Unknown,
                "block server stopped without a shutdown request",
            )),
            Err(e) => phase_failure(e, classifier, |after| classifier.connect_timeout(after)),
        }
    }
}
