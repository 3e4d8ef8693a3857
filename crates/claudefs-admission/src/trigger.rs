//! One-way GC start/stop notifications.
//!
//! The limiter only decides whether reclamation should run. Delivery is
//! edge-triggered and happens while the limiter's aggregate lock is held, so
//! implementations must return quickly and must never call back into the
//! limiter.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A reclamation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GcSignal {
    /// Free space is short, reclamation should run.
    Start,
    /// Free space is healthy, reclamation may idle.
    Stop,
}

impl fmt::Display for GcSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcSignal::Start => write!(f, "start"),
            GcSignal::Stop => write!(f, "stop"),
        }
    }
}

/// Receiver side of the GC decision, implemented by the reclaimer.
pub trait GcTrigger: Send + Sync {
    /// Reclamation should (re-)evaluate and run.
    fn should_start(&self);

    /// Reclamation may (re-)evaluate and idle.
    fn should_stop(&self);

    /// Dispatches a signal to the matching callback.
    fn notify(&self, signal: GcSignal) {
        match signal {
            GcSignal::Start => self.should_start(),
            GcSignal::Stop => self.should_stop(),
        }
    }
}

/// Discards every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGcTrigger;

impl GcTrigger for NoopGcTrigger {
    fn should_start(&self) {}

    fn should_stop(&self) {}
}

/// Keeps every delivered signal in order.
#[derive(Debug, Default)]
pub struct RecordingGcTrigger {
    signals: Mutex<Vec<GcSignal>>,
}

impl RecordingGcTrigger {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All signals delivered so far.
    pub fn signals(&self) -> Vec<GcSignal> {
        self.signals.lock().clone()
    }

    /// The most recent signal, if any.
    pub fn last(&self) -> Option<GcSignal> {
        self.signals.lock().last().copied()
    }

    /// Number of times `signal` was delivered.
    pub fn count(&self, signal: GcSignal) -> usize {
        self.signals.lock().iter().filter(|s| **s == signal).count()
    }

    /// Drops the recorded history.
    pub fn clear(&self) {
        self.signals.lock().clear();
    }
}

impl GcTrigger for RecordingGcTrigger {
    fn should_start(&self) {
        self.signals.lock().push(GcSignal::Start);
    }

    fn should_stop(&self) {
        self.signals.lock().push(GcSignal::Stop);
    }
}

/// Forwards signals to an async reclaimer task over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelGcTrigger {
    tx: mpsc::UnboundedSender<GcSignal>,
}

impl ChannelGcTrigger {
    /// Creates a trigger and the receiver the reclaimer task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GcSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, signal: GcSignal) {
        if self.tx.send(signal).is_err() {
            tracing::debug!(%signal, "GC reclaimer has gone away, signal dropped");
        }
    }
}

impl GcTrigger for ChannelGcTrigger {
    fn should_start(&self) {
        self.send(GcSignal::Start);
    }

    fn should_stop(&self) {
        self.send(GcSignal::Stop);
    }
}
