//! Lifecycle state and first-error tracking

use std::fmt;
use std::sync::Mutex;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Gateway lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Configured, nothing bound yet
    Idle,
    /// Binding sockets and building dispatchers
    Starting,
    /// Serving traffic
    Running,
    /// Cancelled or failed; waiting for tasks to finish
    Draining,
    /// Every task has finished
    Stopped,
}

impl LifecycleState {
    fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Draining)
                | (Running, Draining)
                | (Draining, Stopped)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Observable lifecycle state machine
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Idle);
        Self { tx }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the transition is allowed
    pub fn transition(&self, next: LifecycleState) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });

        if changed {
            debug!("Gateway state -> {}", next);
        } else {
            debug!("Ignored transition {} -> {}", self.state(), next);
        }
        changed
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the first fatal error and cancels the scope when it arrives
#[derive(Debug)]
pub struct FirstError<E> {
    slot: Mutex<Option<E>>,
    token: CancellationToken,
}

impl<E: fmt::Display> FirstError<E> {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            slot: Mutex::new(None),
            token,
        }
    }

    /// Record `err`; returns `false` if an earlier error was already kept
    pub fn record(&self, err: E) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            warn!("Additional gateway error: {}", err);
            return false;
        }
        *slot = Some(err);
        drop(slot);

        self.token.cancel();
        true
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    pub fn take(&self) -> Option<E> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}
