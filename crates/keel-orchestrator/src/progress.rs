//! Progress reporting for loads and downloads.
//!
//! A [`ProgressReporter`] pushes fractions in `[0.0, 1.0]` into an unbounded
//! channel. Values never go backwards: a report lower than the last one sent
//! is dropped.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Named stages of a backend load.
pub mod stage {
    pub const DETECTED: f32 = 0.05;
    pub const PREPARED: f32 = 0.25;
    pub const CONSTRUCTED: f32 = 0.55;
    pub const VALIDATED: f32 = 0.85;
    pub const DONE: f32 = 1.0;
}

/// One progress observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub fraction: f32,
    pub message: String,
}

/// Monotonic progress sink. Cheap to clone; clones share the high-water mark.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<Progress>>,
    last: Arc<Mutex<f32>>,
}

impl ProgressReporter {
    /// Reporter plus the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                last: Arc::new(Mutex::new(0.0)),
            },
            rx,
        )
    }

    /// Reporter that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            last: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn report(&self, fraction: f32, message: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let fraction = fraction.clamp(0.0, 1.0);
        {
            let mut last = self.last.lock();
            if fraction < *last {
                return;
            }
            *last = fraction;
        }
        // Receiver dropped means nobody is listening
        let _ = tx.send(Progress {
            fraction,
            message: message.into(),
        });
    }

    pub fn last(&self) -> f32 {
        *self.last.lock()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::disabled()
    }
}
