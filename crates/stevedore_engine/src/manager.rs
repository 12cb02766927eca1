//! Bucket manager.
//!
//! Owns the scheduler per bucket, validates lifecycle and mutation
//! guards, restores persisted state at startup, and performs graceful
//! shutdown with a hard upper bound.

use crate::error::{EngineError, Result};
use crate::scheduler::{BucketScheduler, SchedulerContext};
use std::collections::HashMap;
use std::time::Duration;
use stevedore_db::QueueDb;
use stevedore_protocol::events::ServiceEvent;
use stevedore_protocol::types::{Bucket, BucketStatus, BucketUpdate, ConflictAction, NewBucket};
use stevedore_protocol::ServiceConfig;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Hard upper bound on graceful shutdown before in-flight workers are
/// abandoned to startup recovery.
pub const SHUTDOWN_BOUND: Duration = Duration::from_secs(30);

pub struct BucketManager {
    db: QueueDb,
    ctx: SchedulerContext,
    config: ServiceConfig,
    schedulers: Mutex<HashMap<i64, BucketScheduler>>,
}

impl BucketManager {
    /// Construct a scheduler for every persisted bucket. None is started;
    /// call [`restore_state`](Self::restore_state) to resume buckets that
    /// were running at the previous shutdown.
    pub async fn new(db: QueueDb, ctx: SchedulerContext, config: ServiceConfig) -> Result<Self> {
        let mut schedulers = HashMap::new();
        for bucket in db.list_buckets().await? {
            schedulers.insert(bucket.id, BucketScheduler::new(bucket.id, ctx.clone()));
        }
        Ok(Self {
            db,
            ctx,
            config,
            schedulers: Mutex::new(schedulers),
        })
    }

    pub fn db(&self) -> &QueueDb {
        &self.db
    }

    /// Start every bucket whose persisted status was `running` at the
    /// previous shutdown.
    pub async fn restore_state(&self) -> Result<()> {
        for bucket in self.db.list_buckets().await? {
            if bucket.status == BucketStatus::Running {
                info!(bucket = bucket.id, name = %bucket.name, "restoring running bucket");
                self.start(bucket.id).await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Bucket CRUD
    // ========================================================================

    pub async fn create_bucket(&self, mut new: NewBucket) -> Result<Bucket> {
        new.worker_count = self.config.clamp_worker_count(new.worker_count);
        let bucket = self.db.create_bucket(&new).await?;

        self.schedulers
            .lock()
            .await
            .insert(bucket.id, BucketScheduler::new(bucket.id, self.ctx.clone()));

        self.ctx.events.publish(ServiceEvent::ServiceChange {
            bucket_id: bucket.id,
            status: bucket.status,
            worker_count: bucket.worker_count,
            active_workers: 0,
        });
        Ok(bucket)
    }

    /// Source list and destination may only change while the scheduler is
    /// stopped; the worker cap applies to subsequent claims immediately.
    pub async fn update_bucket(&self, id: i64, mut update: BucketUpdate) -> Result<Bucket> {
        let scheduler = self.scheduler(id).await?;
        if update.changes_layout() && scheduler.status() != BucketStatus::Stopped {
            return Err(EngineError::invalid(format!(
                "bucket {id} must be stopped to change sources or destination"
            )));
        }
        if let Some(count) = update.worker_count {
            update.worker_count = Some(self.config.clamp_worker_count(count));
        }

        let bucket = self.db.update_bucket(id, &update).await?;
        scheduler.invalidate_bucket_view();

        self.ctx.events.publish(ServiceEvent::ServiceChange {
            bucket_id: bucket.id,
            status: scheduler.status(),
            worker_count: bucket.worker_count,
            active_workers: scheduler.active_workers(),
        });
        Ok(bucket)
    }

    /// Delete a stopped bucket; cascades to its queue rows and ledger
    /// entries.
    pub async fn delete_bucket(&self, id: i64) -> Result<()> {
        let scheduler = self.scheduler(id).await?;
        if scheduler.status() != BucketStatus::Stopped {
            return Err(EngineError::invalid(format!(
                "bucket {id} must be stopped before deletion"
            )));
        }
        self.db.delete_bucket(id).await?;
        self.schedulers.lock().await.remove(&id);
        Ok(())
    }

    pub async fn get_bucket(&self, id: i64) -> Result<Bucket> {
        Ok(self.db.get_bucket(id).await?)
    }

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        Ok(self.db.list_buckets().await?)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn start(&self, id: i64) -> Result<()> {
        self.scheduler(id).await?.start().await
    }

    pub async fn pause(&self, id: i64) -> Result<()> {
        self.scheduler(id).await?.pause().await
    }

    pub async fn resume(&self, id: i64) -> Result<()> {
        self.scheduler(id).await?.resume().await
    }

    pub async fn stop(&self, id: i64) -> Result<()> {
        self.scheduler(id).await?.stop().await
    }

    /// Stop every scheduler concurrently; resolves when all report
    /// stopped.
    pub async fn stop_all(&self) -> Result<()> {
        let schedulers: Vec<BucketScheduler> =
            self.schedulers.lock().await.values().cloned().collect();

        let mut handles = Vec::with_capacity(schedulers.len());
        for scheduler in schedulers {
            handles.push(tokio::spawn(async move { scheduler.stop().await }));
        }
        for handle in handles {
            match handle.await {
                Ok(result) => result?,
                Err(err) => warn!(error = %err, "stop task aborted"),
            }
        }
        Ok(())
    }

    /// Graceful shutdown with a hard upper bound. Past the bound the
    /// in-flight workers are cancelled without committing their rows, so
    /// the next startup's crash recovery returns them to `pending`.
    pub async fn shutdown(&self, bound: Duration) -> Result<()> {
        match tokio::time::timeout(bound, self.stop_all()).await {
            Ok(result) => result,
            Err(_) => {
                self.ctx
                    .log
                    .system("shutdown bound exceeded; abandoning in-flight workers to recovery");
                for scheduler in self.schedulers.lock().await.values() {
                    scheduler.cancel_token().cancel();
                }
                Ok(())
            }
        }
    }

    // ========================================================================
    // Operator actions
    // ========================================================================

    pub async fn resolve_conflict(
        &self,
        bucket_id: i64,
        row_id: i64,
        action: ConflictAction,
    ) -> Result<bool> {
        let resolved = self.db.resolve_conflict(bucket_id, row_id, action).await?;
        if resolved {
            self.wake(bucket_id).await;
        }
        Ok(resolved)
    }

    pub async fn resolve_conflicts_bulk(
        &self,
        bucket_id: Option<i64>,
        action: ConflictAction,
    ) -> Result<u64> {
        let resolved = self.db.resolve_conflicts_bulk(bucket_id, action).await?;
        if resolved > 0 {
            self.wake_scope(bucket_id).await;
        }
        Ok(resolved)
    }

    pub async fn retry_error(&self, bucket_id: i64, row_id: i64) -> Result<bool> {
        let retried = self.db.retry_error(bucket_id, row_id).await?;
        if retried {
            self.wake(bucket_id).await;
        }
        Ok(retried)
    }

    pub async fn retry_errors_bulk(&self, bucket_id: Option<i64>) -> Result<u64> {
        let retried = self.db.retry_errors_bulk(bucket_id).await?;
        if retried > 0 {
            self.wake_scope(bucket_id).await;
        }
        Ok(retried)
    }

    /// Nudge a bucket's scheduler after external seeding (scanner).
    pub async fn wake(&self, bucket_id: i64) {
        if let Some(scheduler) = self.schedulers.lock().await.get(&bucket_id) {
            scheduler.wake();
        }
    }

    async fn wake_scope(&self, bucket_id: Option<i64>) {
        match bucket_id {
            Some(id) => self.wake(id).await,
            None => {
                for scheduler in self.schedulers.lock().await.values() {
                    scheduler.wake();
                }
            }
        }
    }

    async fn scheduler(&self, id: i64) -> Result<BucketScheduler> {
        self.schedulers
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::BucketNotFound(id))
    }
}
