//! Receivers for events parsed from a worker's stdout.

use async_trait::async_trait;
use tokio::sync::mpsc;
use torbiz_core::WorkerEvent;

use crate::error::BridgeError;

/// Callback invoked for every event a worker emits, in emission order.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: WorkerEvent) -> Result<(), BridgeError>;
}

/// Forwards events to an unbounded channel.
///
/// Events are dropped silently once the receiver is gone.
pub struct ChannelHandler {
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ChannelHandler {
    /// Create a handler and the receiver for its events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { event_tx: tx }, rx)
    }

    /// Create a handler with a bounded channel.
    ///
    /// The worker's stdout is not read while the channel is full.
    pub fn with_capacity(capacity: usize) -> (BoundedChannelHandler, mpsc::Receiver<WorkerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (BoundedChannelHandler { event_tx: tx }, rx)
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn on_event(&self, event: WorkerEvent) -> Result<(), BridgeError> {
        self.event_tx.send(event).ok();
        Ok(())
    }
}

/// Bounded variant of [`ChannelHandler`].
pub struct BoundedChannelHandler {
    event_tx: mpsc::Sender<WorkerEvent>,
}

#[async_trait]
impl EventHandler for BoundedChannelHandler {
    async fn on_event(&self, event: WorkerEvent) -> Result<(), BridgeError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use torbiz_core::{FinalResult, TokenEvent};

    #[tokio::test]
    async fn test_channel_handler_forwards_in_order() {
        let (handler, mut rx) = ChannelHandler::new();
        handler.on_event(TokenEvent::delta("Hi").into()).await.unwrap();
        handler.on_event(FinalResult::new("Hi").into()).await.unwrap();

        assert!(matches!(rx.recv().await, Some(WorkerEvent::Token(_))));
        assert!(matches!(rx.recv().await, Some(WorkerEvent::Final(_))));
    }

    #[tokio::test]
    async fn test_bounded_handler_reports_closed_channel() {
        let (handler, rx) = ChannelHandler::with_capacity(1);
        drop(rx);
        let err = handler
            .on_event(TokenEvent::delta("x").into())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ChannelClosed));
    }
}
