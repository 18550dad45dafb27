//! Cancellation scope for relay and accept tasks
//!
//! Every task spawned through a [`TaskScope`] stops when the scope's token is
//! cancelled and is counted until it finishes, so shutdown can wait for all
//! relays with a bounded grace period.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Tracks tasks that share one cancellation token
#[derive(Debug, Clone)]
pub struct TaskScope {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TaskScope {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tracker: TaskTracker::new(),
        }
    }

    /// Scope whose token is a child of `parent`
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self::new(parent.child_token())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a task that is dropped as soon as the scope is cancelled
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });
    }

    /// Spawn a tracked task that handles cancellation itself
    ///
    /// Used for HTTP connections, which shut down gracefully on cancel
    /// instead of being dropped.
    pub fn track<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Number of tasks still running
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting new tasks and wait for running ones
    ///
    /// Returns `false` if tasks were still running after `grace`.
    pub async fn close_and_wait(&self, grace: Duration) -> bool {
        self.tracker.close();
        match timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                debug!("All scoped tasks finished");
                true
            }
            Err(_) => {
                warn!(
                    "{} task(s) still running after {:?}",
                    self.tracker.len(),
                    grace
                );
                false
            }
        }
    }
}
