//! Ownership of background tasks.
//!
//! Periodic cleanup, bus listeners, rate-limit drains and offline replay all
//! run as Tokio tasks. A [`TaskGroup`] owns them: every task is raced against
//! the group's cancellation token, and [`TaskGroup::shutdown`] (or dropping
//! the group) stops them all.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct TaskGroup {
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled when the group shuts down.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Spawn a task that stops when the group shuts down.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            tracing::debug!(task = name, "task group already shut down, not spawning");
            return;
        }
        let token = self.token.child_token();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(task = name, "background task cancelled");
                }
                _ = task => {}
            }
        });
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn shutdown(&self) {
        self.token.cancel();
        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            handle.abort();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks that have not finished yet.
    pub fn active(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}
