//! JSON-lines output of protocol events to stdout.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use torbiz_core::WorkerEvent;
use tracing::{debug, warn};

/// Errors that can occur while emitting an event.
#[derive(Debug, Error)]
pub enum EmitError {
    /// The output channel refused the write (usually the host went away).
    #[error("Failed to write event: {0}")]
    Io(#[from] io::Error),

    /// A terminal event was already written; nothing may follow it.
    #[error("Terminal event already emitted")]
    AfterTerminal,
}

/// Writes events as one JSON object per line, flushed before returning.
///
/// The sink is guarded by a mutex so lines from the supervisor and the
/// heartbeat task never interleave, and emission order equals call order.
pub struct EventEmitter {
    sink: Mutex<Box<dyn Write + Send>>,
    terminal_emitted: AtomicBool,
}

impl EventEmitter {
    /// Create an emitter over any writer.
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
            terminal_emitted: AtomicBool::new(false),
        }
    }

    /// Emitter on the process stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Serialize and write one event.
    ///
    /// Once a terminal event has been written every later call fails with
    /// [`EmitError::AfterTerminal`] and writes nothing.
    pub fn emit(&self, event: impl Into<WorkerEvent>) -> Result<(), EmitError> {
        let event = event.into();
        let mut line = event.to_line().map_err(io::Error::from)?;
        line.push('\n');

        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if self.terminal_emitted.load(Ordering::SeqCst) {
            warn!(line = %line.trim_end(), "Dropping event after terminal event");
            return Err(EmitError::AfterTerminal);
        }
        if event.is_terminal() {
            self.terminal_emitted.store(true, Ordering::SeqCst);
        }
        sink.write_all(line.as_bytes())?;
        sink.flush()?;
        debug!(terminal = event.is_terminal(), "Emitted event");
        Ok(())
    }

    /// Whether a terminal event has been written.
    pub fn terminal_emitted(&self) -> bool {
        self.terminal_emitted.load(Ordering::SeqCst)
    }
}

/// In-memory sink for inspecting emitted lines in tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct MemorySink(std::sync::Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl MemorySink {
    pub(crate) fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub(crate) fn events(&self) -> Vec<WorkerEvent> {
        self.lines()
            .iter()
            .map(|line| WorkerEvent::from_line(line).unwrap())
            .collect()
    }
}

#[cfg(test)]
impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
