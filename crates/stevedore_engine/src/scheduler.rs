//! Per-bucket scheduler.
//!
//! One cooperative loop per bucket: pick the first source folder with
//! work, claim a batch of pending rows bounded by the free worker slots,
//! dispatch copy workers on the blocking pool, and route their outcomes
//! back into the queue store. Pause stops claiming while in-flight
//! workers run to completion; stop additionally drains to zero workers.

use crate::cancel::CancellationToken;
use crate::copier::{copy_file, CopyOutcome, CopyRequest};
use crate::error::{EngineError, Result};
use crate::events::{EventBroadcaster, ProgressCollector};
use crate::translog::{TransferLog, TransferRecord};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use stevedore_db::{CommitExtras, QueueDb};
use stevedore_protocol::defaults::INTEGRITY_ERROR_MESSAGE;
use stevedore_protocol::events::{ProgressEvent, ServiceEvent, StatusChangeEvent};
use stevedore_protocol::types::{Bucket, BucketStatus, FileStatus, FolderActivity, QueueEntry};
use stevedore_protocol::HashAlgorithm;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Reschedule interval while work was found or workers are active.
const BUSY_POLL: Duration = Duration::from_millis(200);
/// Reschedule interval while idle.
const IDLE_POLL: Duration = Duration::from_secs(1);
/// How long a folder-counts snapshot may be reused before it is refreshed.
/// Invalidated early on every successful claim.
const FOLDER_SNAPSHOT_TTL: Duration = Duration::from_millis(500);
/// Poll interval while waiting for in-flight workers to drain.
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Process-scoped services shared by every scheduler.
#[derive(Clone)]
pub struct SchedulerContext {
    pub db: QueueDb,
    pub events: EventBroadcaster,
    pub progress: ProgressCollector,
    pub log: Arc<dyn TransferLog>,
    pub hash_algorithm: HashAlgorithm,
    pub copy_buffer_size: usize,
    /// Hard upper bound on any bucket's effective worker cap.
    pub worker_max_count: u32,
}

/// Handle to one bucket's scheduler. Clone is cheap and shares state.
#[derive(Clone)]
pub struct BucketScheduler {
    shared: Arc<Shared>,
}

struct Shared {
    bucket_id: i64,
    ctx: SchedulerContext,
    /// Runtime status; the persisted copy lives on the bucket row.
    status: watch::Sender<BucketStatus>,
    active_workers: AtomicU32,
    /// Strictly increasing, stamped into each claim batch. Observational
    /// only; the store remains the arbiter of ownership.
    next_worker_id: AtomicI64,
    wake: Notify,
    cancel: CancellationToken,
    bucket_view: StdMutex<Option<Bucket>>,
    folder_snapshot: StdMutex<Option<(Instant, HashMap<String, FolderActivity>)>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BucketScheduler {
    pub fn new(bucket_id: i64, ctx: SchedulerContext) -> Self {
        let (status, _) = watch::channel(BucketStatus::Stopped);
        Self {
            shared: Arc::new(Shared {
                bucket_id,
                ctx,
                status,
                active_workers: AtomicU32::new(0),
                next_worker_id: AtomicI64::new(0),
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                bucket_view: StdMutex::new(None),
                folder_snapshot: StdMutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn bucket_id(&self) -> i64 {
        self.shared.bucket_id
    }

    pub fn status(&self) -> BucketStatus {
        *self.shared.status.borrow()
    }

    pub fn active_workers(&self) -> u32 {
        self.shared.active_workers.load(Ordering::SeqCst)
    }

    /// Token handed to every copy worker; cancelled only by the
    /// hard-bounded shutdown path.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Drop the cached bucket view after a bucket mutation.
    pub fn invalidate_bucket_view(&self) {
        if let Ok(mut view) = self.shared.bucket_view.lock() {
            *view = None;
        }
        self.wake();
    }

    /// Nudge the loop out of its sleep (new rows, resolution, retry).
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    /// stopped -> running.
    pub async fn start(&self) -> Result<()> {
        let previous = self.shared.status.send_replace(BucketStatus::Running);
        self.shared.ctx.db
            .set_bucket_status(self.shared.bucket_id, BucketStatus::Running)
            .await?;

        if previous == BucketStatus::Stopped {
            let shared = self.shared.clone();
            let mut slot = self.shared.task.lock().await;
            if let Some(old) = slot.take() {
                // A previous loop may still be draining; let it finish.
                let _ = old.await;
            }
            *slot = Some(tokio::spawn(async move { run_loop(shared).await }));
        }

        self.shared.wake.notify_one();
        self.shared.publish_service_change().await;
        Ok(())
    }

    /// running -> paused. In-flight workers run to completion; no new
    /// work is claimed.
    pub async fn pause(&self) -> Result<()> {
        if self.status() != BucketStatus::Running {
            return Err(EngineError::invalid(format!(
                "bucket {} is not running",
                self.shared.bucket_id
            )));
        }
        self.shared.status.send_replace(BucketStatus::Paused);
        self.shared.ctx.db
            .set_bucket_status(self.shared.bucket_id, BucketStatus::Paused)
            .await?;
        self.shared.publish_service_change().await;
        Ok(())
    }

    /// paused -> running.
    pub async fn resume(&self) -> Result<()> {
        if self.status() != BucketStatus::Paused {
            return Err(EngineError::invalid(format!(
                "bucket {} is not paused",
                self.shared.bucket_id
            )));
        }
        self.shared.status.send_replace(BucketStatus::Running);
        self.shared.ctx.db
            .set_bucket_status(self.shared.bucket_id, BucketStatus::Running)
            .await?;
        self.shared.wake.notify_one();
        self.shared.publish_service_change().await;
        Ok(())
    }

    /// {running, paused} -> stopped. Resolves once the active worker
    /// count has reached zero.
    pub async fn stop(&self) -> Result<()> {
        let previous = self.shared.status.send_replace(BucketStatus::Stopped);
        self.shared.ctx.db
            .set_bucket_status(self.shared.bucket_id, BucketStatus::Stopped)
            .await?;
        self.shared.wake.notify_one();

        if previous != BucketStatus::Stopped {
            let handle = self.shared.task.lock().await.take();
            if let Some(handle) = handle {
                if let Err(err) = handle.await {
                    warn!(bucket = self.shared.bucket_id, error = %err, "scheduler task aborted");
                }
            }
        }

        // A concurrent stop may have taken the handle; either way the
        // caller only resolves once every worker has finished.
        while self.shared.active_workers.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        self.shared.publish_service_change().await;
        Ok(())
    }
}

async fn run_loop(shared: Arc<Shared>) {
    let mut status_rx = shared.status.subscribe();
    loop {
        let status = *status_rx.borrow_and_update();
        match status {
            BucketStatus::Stopped => break,
            BucketStatus::Paused => {
                tokio::select! {
                    _ = status_rx.changed() => {}
                    _ = shared.wake.notified() => {}
                }
                continue;
            }
            BucketStatus::Running => {}
        }

        let found_work = match tick(&shared).await {
            Ok(found) => found,
            Err(err) => {
                warn!(bucket = shared.bucket_id, error = %err, "scheduler iteration failed");
                false
            }
        };

        let interval = if found_work || shared.active_workers.load(Ordering::SeqCst) > 0 {
            BUSY_POLL
        } else {
            IDLE_POLL
        };
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shared.wake.notified() => {}
            _ = status_rx.changed() => {}
        }
    }

    // Stop drains: in-flight workers run to completion, no forced abort.
    while shared.active_workers.load(Ordering::SeqCst) > 0 {
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

/// One claim-and-dispatch iteration. Returns whether a batch was claimed.
async fn tick(shared: &Arc<Shared>) -> Result<bool> {
    let bucket = shared.bucket_view().await?;
    if bucket.source_folders.is_empty() {
        return Ok(false);
    }

    let counts = shared.folder_counts().await?;

    // Folder stickiness: drain folders in source-list order. A folder
    // with only in-flight rows still blocks the next one.
    let Some(folder) = bucket
        .source_folders
        .iter()
        .find(|folder| counts.get(*folder).is_some_and(FolderActivity::is_active))
    else {
        return Ok(false);
    };

    let activity = counts[folder];
    if activity.pending == 0 {
        return Ok(false);
    }

    let cap = bucket.worker_count.min(shared.ctx.worker_max_count).max(1);
    let active = shared.active_workers.load(Ordering::SeqCst);
    if active >= cap {
        return Ok(false);
    }
    let slots = cap - active;

    let worker_id = shared.next_worker_id.fetch_add(1, Ordering::SeqCst) + 1;
    let claimed = shared
        .ctx
        .db
        .claim(shared.bucket_id, Some(folder), slots, worker_id)
        .await?;
    shared.invalidate_folder_snapshot();

    if claimed.is_empty() {
        return Ok(false);
    }
    debug!(
        bucket = shared.bucket_id,
        folder = folder.as_str(),
        claimed = claimed.len(),
        worker_id,
        "claimed batch"
    );

    for entry in claimed {
        dispatch(shared, entry, &bucket);
    }
    Ok(true)
}

fn dispatch(shared: &Arc<Shared>, entry: QueueEntry, bucket: &Bucket) {
    shared.active_workers.fetch_add(1, Ordering::SeqCst);
    shared.publish_status(&entry, FileStatus::InProgress);

    let shared = shared.clone();
    let bucket_name = bucket.name.clone();
    tokio::spawn(async move {
        shared.run_worker(entry, bucket_name).await;
        shared.active_workers.fetch_sub(1, Ordering::SeqCst);
        shared.wake.notify_one();
    });
}

impl Shared {
    /// Run one copy on the blocking pool and route its outcome into the
    /// store. Workers never mutate durable state themselves.
    async fn run_worker(&self, entry: QueueEntry, bucket_name: String) {
        // A row with a recorded source hash but a cleared destination hash
        // was requeued by an overwrite resolution: the existing
        // destination gets replaced instead of compared.
        let overwrite = entry.source_hash.is_some() && entry.destination_hash.is_none();
        let request = CopyRequest {
            source_path: PathBuf::from(&entry.source_path),
            destination_path: PathBuf::from(&entry.destination_path),
            file_size: entry.file_size,
            overwrite,
        };
        let algorithm = self.ctx.hash_algorithm;
        let buffer_size = self.ctx.copy_buffer_size;
        let cancel = self.cancel.clone();
        let progress = self.ctx.progress.clone();
        let (bucket_id, file_id, file_size) = (entry.bucket_id, entry.id, entry.file_size);

        let joined = tokio::task::spawn_blocking(move || {
            let mut on_progress = |bytes: u64| {
                progress.record(ProgressEvent::new(bucket_id, file_id, bytes, file_size));
            };
            copy_file(&request, algorithm, buffer_size, &cancel, &mut on_progress)
        })
        .await;

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => CopyOutcome::Error {
                message: format!("copy worker panicked: {err}"),
            },
        };

        // Shutdown past the grace bound: leave the row in_progress so
        // startup recovery reverts it to pending.
        if self.cancel.is_cancelled() {
            self.ctx.log.system(&format!(
                "shutdown: {} left for startup recovery",
                entry.source_path
            ));
            return;
        }

        let (new_status, extras, label) = route_outcome(outcome);
        let record = TransferRecord {
            bucket_name: &bucket_name,
            source_path: &entry.source_path,
            source_folder: &entry.source_folder,
            file_size: entry.file_size,
            source_hash: extras.source_hash.as_deref(),
            worker_id: entry.worker_id.unwrap_or(0),
            message: extras.error_message.as_deref(),
        };

        match self
            .ctx
            .db
            .commit_outcome(entry.bucket_id, entry.id, new_status, extras.clone())
            .await
        {
            Ok(()) => {
                self.publish_status(&entry, new_status);
                self.ctx.log.log(label, &record);
            }
            Err(err) => {
                // The row keeps its prior state; nothing is swallowed.
                error!(
                    bucket = entry.bucket_id,
                    file = entry.id,
                    error = %err,
                    "failed to commit worker outcome"
                );
            }
        }
    }

    async fn bucket_view(&self) -> Result<Bucket> {
        if let Ok(view) = self.bucket_view.lock() {
            if let Some(bucket) = view.as_ref() {
                return Ok(bucket.clone());
            }
        }
        let bucket = self.ctx.db.get_bucket(self.bucket_id).await?;
        if let Ok(mut view) = self.bucket_view.lock() {
            *view = Some(bucket.clone());
        }
        Ok(bucket)
    }

    async fn folder_counts(&self) -> Result<HashMap<String, FolderActivity>> {
        if let Ok(snapshot) = self.folder_snapshot.lock() {
            if let Some((taken_at, counts)) = snapshot.as_ref() {
                if taken_at.elapsed() < FOLDER_SNAPSHOT_TTL {
                    return Ok(counts.clone());
                }
            }
        }
        let counts = self.ctx.db.folder_active_counts(self.bucket_id).await?;
        if let Ok(mut snapshot) = self.folder_snapshot.lock() {
            *snapshot = Some((Instant::now(), counts.clone()));
        }
        Ok(counts)
    }

    fn invalidate_folder_snapshot(&self) {
        if let Ok(mut snapshot) = self.folder_snapshot.lock() {
            *snapshot = None;
        }
    }

    fn publish_status(&self, entry: &QueueEntry, status: FileStatus) {
        self.ctx
            .events
            .publish(ServiceEvent::StatusChange(StatusChangeEvent {
                bucket_id: entry.bucket_id,
                file_id: entry.id,
                status,
                source_path: entry.source_path.clone(),
                timestamp: QueueDb::now_millis(),
            }));
    }

    async fn publish_service_change(&self) {
        let worker_count = match self.bucket_view().await {
            Ok(bucket) => bucket.worker_count.min(self.ctx.worker_max_count).max(1),
            Err(_) => 0,
        };
        self.ctx.events.publish(ServiceEvent::ServiceChange {
            bucket_id: self.bucket_id,
            status: *self.status.borrow(),
            worker_count,
            active_workers: self.active_workers.load(Ordering::SeqCst),
        });
    }
}

/// Translate a worker outcome into its durable transition, commit fields,
/// and log label.
pub(crate) fn route_outcome(outcome: CopyOutcome) -> (FileStatus, CommitExtras, &'static str) {
    match outcome {
        CopyOutcome::Completed { hash } => (
            FileStatus::Completed,
            CommitExtras {
                source_hash: Some(hash.clone()),
                destination_hash: Some(hash),
                error_message: None,
            },
            "completed",
        ),
        CopyOutcome::Identical { hash } => (
            FileStatus::Completed,
            CommitExtras {
                source_hash: Some(hash.clone()),
                destination_hash: Some(hash),
                error_message: None,
            },
            "identical",
        ),
        CopyOutcome::Conflict {
            source_hash,
            destination_hash,
        } => (
            FileStatus::Conflict,
            CommitExtras {
                source_hash: Some(source_hash),
                destination_hash: Some(destination_hash),
                error_message: None,
            },
            "conflict",
        ),
        CopyOutcome::IntegrityError {
            source_hash,
            destination_hash,
        } => (
            FileStatus::Error,
            CommitExtras {
                source_hash: Some(source_hash),
                destination_hash: Some(destination_hash),
                error_message: Some(INTEGRITY_ERROR_MESSAGE.to_string()),
            },
            "integrity_error",
        ),
        CopyOutcome::Error { message } => (
            FileStatus::Error,
            CommitExtras {
                source_hash: None,
                destination_hash: None,
                error_message: Some(message),
            },
            "error",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_routing_matches_contract() {
        let (status, extras, label) = route_outcome(CopyOutcome::Completed { hash: "h".into() });
        assert_eq!(status, FileStatus::Completed);
        assert_eq!(extras.source_hash, extras.destination_hash);
        assert_eq!(label, "completed");

        let (status, _, label) = route_outcome(CopyOutcome::Identical { hash: "h".into() });
        assert_eq!(status, FileStatus::Completed);
        assert_eq!(label, "identical");

        let (status, extras, _) = route_outcome(CopyOutcome::Conflict {
            source_hash: "a".into(),
            destination_hash: "b".into(),
        });
        assert_eq!(status, FileStatus::Conflict);
        assert_eq!(extras.source_hash.as_deref(), Some("a"));
        assert_eq!(extras.destination_hash.as_deref(), Some("b"));

        let (status, extras, label) = route_outcome(CopyOutcome::IntegrityError {
            source_hash: "a".into(),
            destination_hash: "b".into(),
        });
        assert_eq!(status, FileStatus::Error);
        assert_eq!(extras.error_message.as_deref(), Some(INTEGRITY_ERROR_MESSAGE));
        assert_eq!(label, "integrity_error");

        let (status, extras, _) = route_outcome(CopyOutcome::Error {
            message: "No such file or directory".into(),
        });
        assert_eq!(status, FileStatus::Error);
        assert!(extras.source_hash.is_none());
        assert_eq!(
            extras.error_message.as_deref(),
            Some("No such file or directory")
        );
    }
}
