//! Cooperative run control checked at batch boundaries.

use crate::error::{MigrateError, Result};
use tokio::sync::watch;

/// Requested run state for an executing migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Cancel,
}

/// Receiving side of a migration's control channel.
///
/// Workers never stop mid-batch: they call [`ControlSignal::checkpoint`]
/// between batches and unwind with `Paused`/`Cancelled` when asked to stop.
#[derive(Debug, Clone)]
pub struct ControlSignal {
    rx: watch::Receiver<Control>,
}

impl ControlSignal {
    /// Create a new control channel in the `Run` state.
    pub fn channel() -> (watch::Sender<Control>, Self) {
        let (tx, rx) = watch::channel(Control::Run);
        (tx, Self { rx })
    }

    /// A signal that never asks to stop.
    pub fn detached() -> Self {
        let (_tx, signal) = Self::channel();
        signal
    }

    pub fn current(&self) -> Control {
        *self.rx.borrow()
    }

    /// Return an error if a pause or cancel has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        match self.current() {
            Control::Run => Ok(()),
            Control::Pause => Err(MigrateError::Paused),
            Control::Cancel => Err(MigrateError::Cancelled),
        }
    }
}
