//! Shutdown drain for in-flight message invocations.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

/// Tracks in-flight work and the abort flag raised when draining times out.
pub struct Drain {
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    abort: watch::Sender<bool>,
}

/// Held for the duration of one accepted invocation.
pub struct InFlightGuard {
    drain: Arc<Drain>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.drain.exit();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// In-flight work finished before the timeout.
    pub drained: bool,
    /// Invocations still running when the abort was raised.
    pub aborted: usize,
    /// Invocations that outlived the abort grace period as well.
    pub abandoned: usize,
}

impl Drain {
    pub fn new() -> Arc<Self> {
        let (abort, _) = watch::channel(false);
        Arc::new(Self {
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            abort,
        })
    }

    /// Register a new invocation, or `None` once shutdown has begun.
    pub fn enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.accepting.load(Ordering::SeqCst) {
            self.exit();
            return None;
        }
        Some(InFlightGuard {
            drain: Arc::clone(self),
        })
    }

    fn exit(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Receiver for the abort flag, handed to coordinators.
    pub fn abort_signal(&self) -> watch::Receiver<bool> {
        self.abort.subscribe()
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work and wait up to `timeout` for in-flight invocations.
    /// Whatever is left is aborted and given the same bound to roll back.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        self.accepting.store(false, Ordering::SeqCst);
        info!(in_flight = self.in_flight(), "draining in-flight messages");

        if tokio::time::timeout(timeout, self.wait_idle()).await.is_ok() {
            return DrainReport {
                drained: true,
                aborted: 0,
                abandoned: 0,
            };
        }

        let aborted = self.in_flight();
        warn!(aborted, "drain timed out, aborting in-flight messages");
        self.abort.send_replace(true);

        let abandoned = match tokio::time::timeout(timeout, self.wait_idle()).await {
            Ok(()) => 0,
            Err(_) => self.in_flight(),
        };
        if abandoned > 0 {
            warn!(abandoned, "in-flight messages did not finish after abort");
        }
        DrainReport {
            drained: false,
            aborted,
            abandoned,
        }
    }
}
