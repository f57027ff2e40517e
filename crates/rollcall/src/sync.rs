//! Offline-first attendance writes and reconciliation.
//!
//! [`OfflineAttendanceSyncEngine`] persists attendance locally no matter
//! what connectivity looks like, marks each record with a `synced` flag, and
//! reconciles unsynced records when a deferred sync task runs. Notifications
//! ride on the sync state: online writes notify immediately, offline writes
//! notify when reconciliation confirms them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::model::{AttendanceRecord, AttendanceStatus, Subject};
use crate::notify::AttendanceNotifier;
use crate::platform::{BackoffPolicy, Connectivity, SyncScheduler};
use crate::store::{collections, from_doc, to_doc, DocumentStore};
use crate::tasks::TaskGroup;

/// Unique key for the deferred sync task. One pending or running sync per
/// process, enforced by the scheduler.
pub const SYNC_TASK_KEY: &str = "attendance_sync";

/// One attendance entry to record, as captured at the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceItem {
    /// Subject the entry is about.
    pub subject_id: String,
    /// Subject display name, carried for notification text.
    pub subject_name: String,
    /// Recorded status.
    pub status: AttendanceStatus,
    /// Free-form notes.
    pub notes: String,
}

impl AttendanceItem {
    /// Create an entry with empty notes.
    #[must_use]
    pub fn new(
        subject_id: impl Into<String>,
        subject_name: impl Into<String>,
        status: AttendanceStatus,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            subject_name: subject_name.into(),
            status,
            notes: String::new(),
        }
    }
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Unsynced records found.
    pub attempted: usize,
    /// Records confirmed this pass.
    pub synced: usize,
    /// Records that failed and remain unsynced.
    pub failed: usize,
}

impl SyncReport {
    /// Map the report onto the task outcome contract: progress counts as
    /// success even when some records failed, since the failures stay
    /// unsynced and a later pass picks them up.
    #[must_use]
    pub fn outcome(&self) -> TaskOutcome {
        if self.attempted > 0 && self.synced == 0 {
            TaskOutcome::Retry
        } else {
            TaskOutcome::Success
        }
    }
}

/// Signal returned to the scheduler from a deferred sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Done; the scheduler drops the task.
    Success,
    /// Nothing confirmed; the scheduler re-runs with backoff.
    Retry,
}

/// Records attendance offline-first and reconciles it later.
pub struct OfflineAttendanceSyncEngine {
    store: Arc<dyn DocumentStore>,
    connectivity: Arc<dyn Connectivity>,
    scheduler: Arc<dyn SyncScheduler>,
    notifier: Arc<dyn AttendanceNotifier>,
    tasks: Arc<TaskGroup>,
    config: SyncConfig,
}

impl std::fmt::Debug for OfflineAttendanceSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineAttendanceSyncEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OfflineAttendanceSyncEngine {
    /// Create an engine over the given store and platform capabilities.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        connectivity: Arc<dyn Connectivity>,
        scheduler: Arc<dyn SyncScheduler>,
        notifier: Arc<dyn AttendanceNotifier>,
        tasks: Arc<TaskGroup>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            connectivity,
            scheduler,
            notifier,
            tasks,
            config,
        }
    }

    /// Record a batch of attendance entries, returning their assigned ids.
    ///
    /// The batch always persists locally. Online, records are written
    /// already-synced and guardians are notified immediately; offline, they
    /// are written unsynced and a deferred sync task is scheduled.
    /// Notification failures never fail the recording.
    ///
    /// # Errors
    ///
    /// Returns an error only if the local write itself fails.
    pub async fn record_attendance(
        &self,
        recorder_id: &str,
        items: Vec<AttendanceItem>,
    ) -> Result<Vec<String>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let online = self.connectivity.is_online();
        let mut docs = Vec::with_capacity(items.len());
        for item in &items {
            let mut record =
                AttendanceRecord::new(&item.subject_id, item.status, recorder_id);
            record.notes = item.notes.clone();
            record.synced = online;
            docs.push(to_doc(&record)?);
        }

        let ids = self
            .store
            .insert_batch(collections::ATTENDANCE, docs)
            .await?;
        info!(count = ids.len(), online, "attendance batch recorded");

        if online {
            let now = chrono::Utc::now();
            for item in items {
                self.spawn_notification(
                    item.subject_id,
                    item.subject_name,
                    item.status,
                    now,
                )
                .await;
            }
        } else {
            self.scheduler.schedule_unique(
                SYNC_TASK_KEY,
                true,
                BackoffPolicy::exponential(self.config.min_backoff()),
            );
            debug!("offline; deferred sync scheduled");
        }

        Ok(ids)
    }

    /// Reconcile every unsynced record with the canonical copy.
    ///
    /// Each record is confirmed independently with a merge write that flips
    /// only the `synced` flag, so a failure on one record never blocks the
    /// rest and concurrent edits to other fields are preserved. A deferred
    /// notification fires for each record confirmed here.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending-record query fails; per-record
    /// failures are counted in the report instead.
    pub async fn reconcile(&self) -> Result<SyncReport> {
        let pending = self
            .store
            .find_by_field(collections::ATTENDANCE, "synced", &json!(false))
            .await?;

        let mut report = SyncReport {
            attempted: pending.len(),
            ..SyncReport::default()
        };

        for doc in pending {
            let record: AttendanceRecord = match from_doc(doc) {
                Ok(record) => record,
                Err(err) => {
                    warn!("skipping malformed attendance record: {err}");
                    report.failed += 1;
                    continue;
                }
            };
            let Some(id) = record.id.clone() else {
                warn!("skipping attendance record without id");
                report.failed += 1;
                continue;
            };

            match self
                .store
                .merge(collections::ATTENDANCE, &id, json!({"synced": true}))
                .await
            {
                Ok(()) => {
                    report.synced += 1;
                    self.notify_reconciled(&record).await;
                }
                Err(err) => {
                    warn!(record_id = %id, "sync confirmation failed: {err}");
                    report.failed += 1;
                }
            }
        }

        info!(
            attempted = report.attempted,
            synced = report.synced,
            failed = report.failed,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    /// Entry point for the deferred sync task.
    ///
    /// Never panics or propagates errors to the scheduler; any failure maps
    /// to [`TaskOutcome::Retry`] so the scheduler's backoff applies.
    pub async fn run_sync_task(&self) -> TaskOutcome {
        match self.reconcile().await {
            Ok(report) => report.outcome(),
            Err(err) => {
                warn!("sync task failed: {err}");
                TaskOutcome::Retry
            }
        }
    }

    /// Number of records still awaiting reconciliation.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn pending_count(&self) -> Result<usize> {
        let pending = self
            .store
            .find_by_field(collections::ATTENDANCE, "synced", &json!(false))
            .await?;
        Ok(pending.len())
    }

    /// Fire a deferred notification for a record confirmed during
    /// reconciliation. The subject name is not stored on the record, so it
    /// is resolved here; a subject deleted since recording just skips the
    /// notification.
    async fn notify_reconciled(&self, record: &AttendanceRecord) {
        let subject_name = match self
            .store
            .get(collections::SUBJECTS, &record.subject_id)
            .await
        {
            Ok(Some(doc)) => match from_doc::<Subject>(doc) {
                Ok(subject) => subject.name,
                Err(err) => {
                    warn!(subject_id = %record.subject_id, "malformed subject: {err}");
                    return;
                }
            },
            Ok(None) => {
                debug!(subject_id = %record.subject_id, "subject gone; skipping notification");
                return;
            }
            Err(err) => {
                warn!(subject_id = %record.subject_id, "subject lookup failed: {err}");
                return;
            }
        };

        self.spawn_notification(
            record.subject_id.clone(),
            subject_name,
            record.status,
            record.timestamp,
        )
        .await;
    }

    /// Detach a notification send. Failures are logged, never surfaced.
    async fn spawn_notification(
        &self,
        subject_id: String,
        subject_name: String,
        status: AttendanceStatus,
        date: chrono::DateTime<chrono::Utc>,
    ) {
        let notifier = Arc::clone(&self.notifier);
        self.tasks
            .spawn(async move {
                if let Err(err) = notifier
                    .send_attendance_update(&subject_id, &subject_name, status, date)
                    .await
                {
                    warn!(subject_id = %subject_id, "attendance notification failed: {err}");
                }
            })
            .await;
    }
}

/// Cheap in-process guard against overlapping manual sync runs, for callers
/// that trigger reconciliation outside the scheduler.
#[derive(Debug, Default)]
pub struct InFlightGuard {
    busy: AtomicBool,
}

impl InFlightGuard {
    /// Create an idle guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard. Returns `None` if a run is already in flight.
    #[must_use]
    pub fn try_begin(&self) -> Option<InFlightPermit<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlightPermit { guard: self })
    }
}

/// Permit held for the duration of a run; releases the guard on drop.
#[derive(Debug)]
pub struct InFlightPermit<'a> {
    guard: &'a InFlightGuard,
}

impl Drop for InFlightPermit<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::platform::{RecordingScheduler, StaticConnectivity};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CountingNotifier {
        sent: Mutex<Vec<(String, AttendanceStatus)>>,
        fail: AtomicBool,
    }

    impl CountingNotifier {
        fn sent(&self) -> Vec<(String, AttendanceStatus)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AttendanceNotifier for CountingNotifier {
        async fn send_attendance_update(
            &self,
            subject_id: &str,
            _subject_name: &str,
            status: AttendanceStatus,
            _date: DateTime<Utc>,
        ) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::NotificationFailed {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((subject_id.to_string(), status));
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<crate::store::MemoryStore>,
        connectivity: Arc<StaticConnectivity>,
        scheduler: Arc<RecordingScheduler>,
        notifier: Arc<CountingNotifier>,
        tasks: Arc<TaskGroup>,
        engine: OfflineAttendanceSyncEngine,
    }

    fn fixture(online: bool) -> Fixture {
        let store = Arc::new(crate::store::MemoryStore::new());
        let connectivity = Arc::new(StaticConnectivity::new(online));
        let scheduler = Arc::new(RecordingScheduler::new());
        let notifier = Arc::new(CountingNotifier::default());
        let tasks = Arc::new(TaskGroup::new());

        let engine = OfflineAttendanceSyncEngine::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::clone(&connectivity) as Arc<dyn Connectivity>,
            Arc::clone(&scheduler) as Arc<dyn SyncScheduler>,
            Arc::clone(&notifier) as Arc<dyn AttendanceNotifier>,
            Arc::clone(&tasks),
            SyncConfig::default(),
        );

        Fixture {
            store,
            connectivity,
            scheduler,
            notifier,
            tasks,
            engine,
        }
    }

    async fn seed_subject(store: &crate::store::MemoryStore, name: &str) -> String {
        let subject = Subject {
            id: None,
            name: name.to_string(),
            class_id: "c-1".to_string(),
            guardian_id: None,
        };
        store
            .insert(collections::SUBJECTS, to_doc(&subject).unwrap())
            .await
            .unwrap()
    }

    fn items_for(subject_ids: &[(String, &str)]) -> Vec<AttendanceItem> {
        subject_ids
            .iter()
            .map(|(id, name)| AttendanceItem::new(id.clone(), *name, AttendanceStatus::Present))
            .collect()
    }

    #[tokio::test]
    async fn test_record_online_marks_synced_and_notifies() {
        let fx = fixture(true);
        let sid = seed_subject(&fx.store, "Sam").await;

        let ids = fx
            .engine
            .record_attendance("r-1", items_for(&[(sid.clone(), "Sam")]))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        let doc = fx
            .store
            .get(collections::ATTENDANCE, &ids[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["synced"], Value::Bool(true));

        fx.tasks.drain().await;
        assert_eq!(fx.notifier.sent(), vec![(sid, AttendanceStatus::Present)]);
        assert_eq!(fx.scheduler.call_count(), 0);
    }

    #[tokio::test]
    async fn test_record_offline_persists_and_schedules() {
        let fx = fixture(false);
        let sid_a = seed_subject(&fx.store, "Sam").await;
        let sid_b = seed_subject(&fx.store, "Ada").await;
        let sid_c = seed_subject(&fx.store, "Kit").await;

        let ids = fx
            .engine
            .record_attendance(
                "r-1",
                items_for(&[
                    (sid_a, "Sam"),
                    (sid_b, "Ada"),
                    (sid_c, "Kit"),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        // Nothing lost: every record is queryable immediately, unsynced.
        assert_eq!(fx.engine.pending_count().await.unwrap(), 3);
        for id in &ids {
            let doc = fx
                .store
                .get(collections::ATTENDANCE, id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(doc["synced"], Value::Bool(false));
        }

        let pending = fx.scheduler.pending(SYNC_TASK_KEY).unwrap();
        assert!(pending.requires_connectivity);
        assert_eq!(pending.backoff.min_interval, Duration::from_secs(10));

        fx.tasks.drain().await;
        assert!(fx.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_offline_batches_collapse_to_one_pending_task() {
        let fx = fixture(false);
        let sid = seed_subject(&fx.store, "Sam").await;

        for _ in 0..3 {
            fx.engine
                .record_attendance("r-1", items_for(&[(sid.clone(), "Sam")]))
                .await
                .unwrap();
        }

        assert_eq!(fx.scheduler.call_count(), 3);
        assert!(fx.scheduler.pending(SYNC_TASK_KEY).is_some());
    }

    #[tokio::test]
    async fn test_reconcile_confirms_and_notifies_deferred() {
        let fx = fixture(false);
        let sid = seed_subject(&fx.store, "Sam").await;

        fx.engine
            .record_attendance(
                "r-1",
                vec![
                    AttendanceItem::new(sid.clone(), "Sam", AttendanceStatus::Late),
                    AttendanceItem::new(sid.clone(), "Sam", AttendanceStatus::Present),
                    AttendanceItem::new(sid.clone(), "Sam", AttendanceStatus::Absent),
                ],
            )
            .await
            .unwrap();

        fx.connectivity.set_online(true);
        let report = fx.engine.reconcile().await.unwrap();

        assert_eq!(report.attempted, 3);
        assert_eq!(report.synced, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.outcome(), TaskOutcome::Success);
        assert_eq!(fx.engine.pending_count().await.unwrap(), 0);

        fx.tasks.drain().await;
        assert_eq!(fx.notifier.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let fx = fixture(false);
        let sid = seed_subject(&fx.store, "Sam").await;
        fx.engine
            .record_attendance("r-1", items_for(&[(sid, "Sam")]))
            .await
            .unwrap();

        let first = fx.engine.reconcile().await.unwrap();
        assert_eq!(first.synced, 1);

        // A second pass finds nothing and must not re-notify.
        let second = fx.engine.reconcile().await.unwrap();
        assert_eq!(second.attempted, 0);
        assert_eq!(second.outcome(), TaskOutcome::Success);

        fx.tasks.drain().await;
        assert_eq!(fx.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_merge_preserves_other_fields() {
        let fx = fixture(false);
        let sid = seed_subject(&fx.store, "Sam").await;
        let ids = fx
            .engine
            .record_attendance("r-1", items_for(&[(sid, "Sam")]))
            .await
            .unwrap();

        // An edit lands between recording and reconciliation.
        fx.store
            .merge(
                collections::ATTENDANCE,
                &ids[0],
                json!({"notes": "left early"}),
            )
            .await
            .unwrap();

        fx.engine.reconcile().await.unwrap();

        let doc = fx
            .store
            .get(collections::ATTENDANCE, &ids[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["synced"], Value::Bool(true));
        assert_eq!(doc["notes"], "left early");
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_recording() {
        let fx = fixture(true);
        let sid = seed_subject(&fx.store, "Sam").await;
        fx.notifier.fail.store(true, Ordering::SeqCst);

        let ids = fx
            .engine
            .record_attendance("r-1", items_for(&[(sid, "Sam")]))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        fx.tasks.drain().await;
        assert!(fx.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_subject_skips_notification_but_syncs() {
        let fx = fixture(false);
        let sid = seed_subject(&fx.store, "Sam").await;
        fx.engine
            .record_attendance("r-1", items_for(&[(sid.clone(), "Sam")]))
            .await
            .unwrap();

        fx.store.delete(collections::SUBJECTS, &sid).await.unwrap();

        let report = fx.engine.reconcile().await.unwrap();
        assert_eq!(report.synced, 1);

        fx.tasks.drain().await;
        assert!(fx.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let fx = fixture(false);
        let ids = fx.engine.record_attendance("r-1", Vec::new()).await.unwrap();
        assert!(ids.is_empty());
        assert_eq!(fx.scheduler.call_count(), 0);
    }

    #[tokio::test]
    async fn test_run_sync_task_outcomes() {
        let fx = fixture(false);
        let sid = seed_subject(&fx.store, "Sam").await;
        fx.engine
            .record_attendance("r-1", items_for(&[(sid, "Sam")]))
            .await
            .unwrap();

        assert_eq!(fx.engine.run_sync_task().await, TaskOutcome::Success);
        // Nothing pending; still success.
        assert_eq!(fx.engine.run_sync_task().await, TaskOutcome::Success);
    }

    #[tokio::test]
    async fn test_run_sync_task_retries_on_store_failure() {
        #[derive(Debug)]
        struct FailingStore {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl DocumentStore for FailingStore {
            async fn get(&self, _: &str, _: &str) -> Result<Option<Value>> {
                Err(Error::store("backend unavailable"))
            }
            async fn find_by_field(&self, _: &str, _: &str, _: &Value) -> Result<Vec<Value>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::store("backend unavailable"))
            }
            async fn insert(&self, _: &str, _: Value) -> Result<String> {
                Err(Error::store("backend unavailable"))
            }
            async fn insert_batch(&self, _: &str, _: Vec<Value>) -> Result<Vec<String>> {
                Err(Error::store("backend unavailable"))
            }
            async fn replace(&self, _: &str, _: &str, _: Value) -> Result<()> {
                Err(Error::store("backend unavailable"))
            }
            async fn merge(&self, _: &str, _: &str, _: Value) -> Result<()> {
                Err(Error::store("backend unavailable"))
            }
            async fn delete(&self, _: &str, _: &str) -> Result<()> {
                Err(Error::store("backend unavailable"))
            }
            async fn transact(&self, _: crate::store::TransactFn) -> Result<()> {
                Err(Error::store("backend unavailable"))
            }
        }

        let failing = Arc::new(FailingStore {
            calls: AtomicUsize::new(0),
        });
        let engine = OfflineAttendanceSyncEngine::new(
            Arc::clone(&failing) as Arc<dyn DocumentStore>,
            Arc::new(StaticConnectivity::new(true)),
            Arc::new(RecordingScheduler::new()),
            Arc::new(CountingNotifier::default()),
            Arc::new(TaskGroup::new()),
            SyncConfig::default(),
        );

        assert_eq!(engine.run_sync_task().await, TaskOutcome::Retry);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_report_outcome_policy() {
        let none_confirmed = SyncReport {
            attempted: 3,
            synced: 0,
            failed: 3,
        };
        assert_eq!(none_confirmed.outcome(), TaskOutcome::Retry);

        let partial = SyncReport {
            attempted: 3,
            synced: 1,
            failed: 2,
        };
        assert_eq!(partial.outcome(), TaskOutcome::Success);

        let empty = SyncReport::default();
        assert_eq!(empty.outcome(), TaskOutcome::Success);
    }

    #[test]
    fn test_in_flight_guard_excludes_overlap() {
        let guard = InFlightGuard::new();

        let permit = guard.try_begin().unwrap();
        assert!(guard.try_begin().is_none());

        drop(permit);
        assert!(guard.try_begin().is_some());
    }
}
