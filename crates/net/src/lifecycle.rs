//! Run/stop bookkeeping shared by all loop-based components

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Lifecycle of a loop-based component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Constructed, loop not started yet
    Created,
    /// Loop is running
    Running,
    /// Stop requested, loop has not exited yet
    Stopping,
    /// Loop exited and the socket was released
    Closed,
}

/// Tracks the state of one loop and carries its stop signal
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: Mutex<LoopState>,
    stop_tx: watch::Sender<bool>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(LoopState::Created),
            stop_tx,
        }
    }

    pub(crate) fn state(&self) -> LoopState {
        *self.state.lock()
    }

    /// Move `Created -> Running`. A loop can only be started once.
    pub(crate) fn start(&self) -> Result<StopSignal> {
        let mut state = self.state.lock();
        if *state != LoopState::Created {
            return Err(Error::AlreadyStarted);
        }
        *state = LoopState::Running;
        Ok(StopSignal {
            rx: self.stop_tx.subscribe(),
        })
    }

    /// Request the loop to stop. Returns false if it had already stopped.
    pub(crate) fn stop(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            LoopState::Closed => return false,
            LoopState::Running => *state = LoopState::Stopping,
            // Stopped before start: the loop will exit as soon as it begins
            LoopState::Created | LoopState::Stopping => {}
        }
        self.stop_tx.send_replace(true);
        true
    }

    pub(crate) fn close(&self) {
        *self.state.lock() = LoopState::Closed;
    }
}

/// Receiving side of a stop request, held by the running loop
#[derive(Debug)]
pub(crate) struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub(crate) fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop has been requested
    pub(crate) async fn stopped(&mut self) {
        // The sender lives as long as the component, so an error here only
        // means the component was dropped: treat it as a stop.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_only_once() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LoopState::Created);
        assert!(lifecycle.start().is_ok());
        assert_eq!(lifecycle.state(), LoopState::Running);
        assert!(matches!(lifecycle.start(), Err(Error::AlreadyStarted)));
    }

    #[test]
    fn test_stop_transitions() {
        let lifecycle = Lifecycle::new();
        let signal = lifecycle.start().unwrap();
        assert!(!signal.is_stopped());

        assert!(lifecycle.stop());
        assert_eq!(lifecycle.state(), LoopState::Stopping);
        assert!(signal.is_stopped());

        lifecycle.close();
        assert_eq!(lifecycle.state(), LoopState::Closed);
        assert!(!lifecycle.stop());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_observed() {
        let lifecycle = Lifecycle::new();
        lifecycle.stop();
        let mut signal = lifecycle.start().unwrap();
        assert!(signal.is_stopped());
        signal.stopped().await;
    }
}
