//! Supervised background tasks.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Worker pool for long-running tasks.
///
/// Every task receives a child of the pool's cancellation token and is
/// expected to return promptly once it fires.
pub struct Pool {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Pool {
    /// Create a new pool.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run `task` on the pool.
    pub fn go<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task(self.token.child_token()));
    }

    /// Track `task`, which watches its own cancellation.
    pub fn spawn<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Token canceled when the pool stops, for work owned outside the pool.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn stop(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("Worker pool stopped");
    }

    /// Get the number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}
