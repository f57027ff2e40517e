//! Supervised fire-and-forget tasks.
//!
//! Notification sends and sync scheduling must never block or fail their
//! caller, but they also must not leak: the group is scoped to the process
//! and can be drained on shutdown (and in tests, to assert on side effects).

use std::future::Future;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::warn;

/// A group of detached tasks whose completion can be awaited.
///
/// Task results are never joined by the spawning call site; panics are
/// logged during [`TaskGroup::drain`] and otherwise absorbed.
#[derive(Debug, Default)]
pub struct TaskGroup {
    inner: Mutex<JoinSet<()>>,
}

impl TaskGroup {
    /// Create an empty task group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a fire-and-forget task into the group.
    pub async fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.lock().await.spawn(future);
    }

    /// Number of tasks not yet drained.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether the group has no outstanding tasks.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Wait for every outstanding task to finish.
    pub async fn drain(&self) {
        let mut set = self.inner.lock().await;
        while let Some(result) = set.join_next().await {
            if let Err(err) = result {
                warn!("detached task failed: {err}");
            }
        }
    }
}
