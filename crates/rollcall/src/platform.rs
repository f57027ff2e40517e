//! Platform capability abstractions.
//!
//! Connectivity reporting and deferred-task scheduling belong to the host
//! platform. The sync engine polls connectivity at call time rather than
//! maintaining its own network state machine, and defers retry policy
//! entirely to the scheduler.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Point-in-time connectivity report.
pub trait Connectivity: Send + Sync {
    /// Whether the device currently has validated internet access.
    fn is_online(&self) -> bool;
}

/// Backoff behavior for a scheduled task's retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    /// Delay doubles after each retry.
    Exponential,
}

/// Retry policy attached to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// How the delay grows between retries.
    pub kind: BackoffKind,
    /// Delay before the first retry.
    pub min_interval: Duration,
}

impl BackoffPolicy {
    /// Exponential backoff starting at the given interval.
    #[must_use]
    pub fn exponential(min_interval: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            min_interval,
        }
    }
}

/// Deferred background task scheduling.
///
/// Implementations guarantee at most one pending or running task per
/// `task_key`; scheduling the same key again replaces the pending task.
pub trait SyncScheduler: Send + Sync {
    /// Request a deferred run of the named task.
    fn schedule_unique(&self, task_key: &str, requires_connectivity: bool, backoff: BackoffPolicy);

    /// Cancel a pending task, if any.
    fn cancel(&self, task_key: &str);
}

/// Fixed connectivity report, for tests and embedding.
#[derive(Debug, Default)]
pub struct StaticConnectivity {
    online: AtomicBool,
}

impl StaticConnectivity {
    /// Create a report with the given initial state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Flip the reported state.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Connectivity for StaticConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Recording scheduler double: remembers the last request per key and counts
/// schedule calls. Replacement semantics mirror the platform contract.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    requests: Mutex<Vec<ScheduledRequest>>,
    calls: AtomicUsize,
}

/// A request captured by [`RecordingScheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRequest {
    /// Task key the request was made under.
    pub task_key: String,
    /// Whether the task requires connectivity.
    pub requires_connectivity: bool,
    /// Requested backoff policy.
    pub backoff: BackoffPolicy,
}

impl RecordingScheduler {
    /// Create an empty recording scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently pending request for a key, if any.
    #[must_use]
    pub fn pending(&self, task_key: &str) -> Option<ScheduledRequest> {
        self.requests
            .lock()
            .ok()?
            .iter()
            .find(|r| r.task_key == task_key)
            .cloned()
    }

    /// Total number of `schedule_unique` calls observed.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SyncScheduler for RecordingScheduler {
    fn schedule_unique(&self, task_key: &str, requires_connectivity: bool, backoff: BackoffPolicy) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            // Replace any pending request under the same key.
            requests.retain(|r| r.task_key != task_key);
            requests.push(ScheduledRequest {
                task_key: task_key.to_string(),
                requires_connectivity,
                backoff,
            });
        }
    }

    fn cancel(&self, task_key: &str) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.retain(|r| r.task_key != task_key);
        }
    }
}
