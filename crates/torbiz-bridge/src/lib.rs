//! Host-side bridge to the Torbiz worker
//!
//! Spawns `torbiz-worker` as a child process, parses its JSON-lines stdout
//! into [`WorkerEvent`](torbiz_core::WorkerEvent)s and forwards them to an
//! [`EventHandler`] in emission order.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use torbiz_bridge::{ChannelHandler, WorkerLauncher};
//! use torbiz_core::{Mode, OperationRequest};
//!
//! async fn ask() -> Result<(), Box<dyn std::error::Error>> {
//!     let launcher = WorkerLauncher::new("torbiz-worker");
//!     let request = OperationRequest::new(Mode::Local, "TinyLlama/TinyLlama-1.1B-Chat-v1.0", "Hi")
//!         .with_streaming(true);
//!
//!     let (handler, mut rx) = ChannelHandler::new();
//!     let handle = launcher.spawn(&request, Arc::new(handler))?;
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = rx.recv().await {
//!             println!("{:?}", event);
//!         }
//!     });
//!
//!     let outcome = handle.wait().await?;
//!     println!("exit code {}", outcome.exit_code);
//!     Ok(())
//! }
//! ```

mod error;
mod handler;
mod launcher;

pub use error::BridgeError;
pub use handler::{BoundedChannelHandler, ChannelHandler, EventHandler};
pub use launcher::{WorkerHandle, WorkerLauncher, WorkerOutcome};
