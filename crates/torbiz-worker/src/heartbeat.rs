//! Periodic "still working" reports while a blocking phase is pending.
//!
//! A [`HeartbeatMonitor`] ticks every `interval` after it is started. Ticks
//! are delivered under a gate shared with [`HeartbeatHandle::stop`], so once
//! `stop` returns no further tick can be delivered, and a phase that resolves
//! after `T` has reported exactly `floor(T / interval)` ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

type TickFn = dyn Fn(u64, Duration) + Send + Sync;

struct Shared {
    /// Number of ticks delivered so far.
    gate: Mutex<u64>,
    /// Set only by the owner of the handle when the phase resolves.
    resolved: AtomicBool,
    on_tick: Box<TickFn>,
    interval: Duration,
}

impl Shared {
    /// Deliver every tick up to and including `due`, unless resolved.
    fn deliver_through(&self, due: u64) -> bool {
        let mut delivered = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        if self.resolved.load(Ordering::Acquire) {
            return false;
        }
        self.deliver_locked(&mut delivered, due);
        true
    }

    /// Catch up to `due` and mark resolved in one critical section.
    fn resolve_through(&self, due: u64) -> u64 {
        let mut delivered = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        if !self.resolved.load(Ordering::Acquire) {
            self.deliver_locked(&mut delivered, due);
            self.resolved.store(true, Ordering::Release);
        }
        *delivered
    }

    fn deliver_locked(&self, delivered: &mut u64, due: u64) {
        while *delivered < due {
            *delivered += 1;
            let elapsed = self
                .interval
                .saturating_mul(u32::try_from(*delivered).unwrap_or(u32::MAX));
            trace!(tick = *delivered, elapsed_secs = elapsed.as_secs(), "Heartbeat");
            (self.on_tick)(*delivered, elapsed);
        }
    }
}

/// Starts heartbeat tasks.
pub struct HeartbeatMonitor;

impl HeartbeatMonitor {
    /// Start ticking on the current runtime.
    ///
    /// `on_tick` receives the tick number (starting at 1) and the elapsed
    /// time the tick stands for. It runs with the gate held and must not
    /// block for long.
    pub fn start<F>(interval: Duration, on_tick: F) -> HeartbeatHandle
    where
        F: Fn(u64, Duration) + Send + Sync + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));
        let shared = Arc::new(Shared {
            gate: Mutex::new(0),
            resolved: AtomicBool::new(false),
            on_tick: Box::new(on_tick),
            interval,
        });
        let started = Instant::now();
        let wake = CancellationToken::new();
        let task = tokio::spawn(run_ticks(shared.clone(), started, wake.clone()));

        HeartbeatHandle {
            shared,
            started,
            wake,
            task,
        }
    }
}

async fn run_ticks(shared: Arc<Shared>, started: Instant, wake: CancellationToken) {
    let mut next_due = started;
    let mut tick: u64 = 0;
    loop {
        next_due += shared.interval;
        tick += 1;
        tokio::select! {
            _ = wake.cancelled() => break,
            _ = tokio::time::sleep_until(next_due) => {}
        }
        if !shared.deliver_through(tick) {
            break;
        }
    }
}

/// Owner side of a running heartbeat.
pub struct HeartbeatHandle {
    shared: Arc<Shared>,
    started: Instant,
    wake: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Mark the phase resolved and stop ticking.
    ///
    /// Ticks that were due but not yet delivered are delivered first.
    /// Returns the total number of ticks delivered.
    pub fn stop(self) -> u64 {
        self.halt()
    }

    fn halt(&self) -> u64 {
        let due = (self.started.elapsed().as_nanos() / self.shared.interval.as_nanos()) as u64;
        let delivered = self.shared.resolve_through(due);
        self.wake.cancel();
        delivered
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.halt();
        if !self.task.is_finished() {
            self.task.abort();
        }
    }
}
