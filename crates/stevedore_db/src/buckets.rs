//! Bucket CRUD and status persistence.

use crate::error::{map_unique, DbError, Result};
use crate::row::row_to_bucket;
use crate::QueueDb;
use sqlx::Row;
use stevedore_protocol::types::{Bucket, BucketStatus, BucketUpdate, FileStatus, NewBucket};

impl QueueDb {
    /// Create a bucket. The name must be unique; source list and
    /// destination must be non-empty.
    pub async fn create_bucket(&self, new: &NewBucket) -> Result<Bucket> {
        if new.name.trim().is_empty() {
            return Err(DbError::invalid_state("bucket name must not be empty"));
        }
        if new.source_folders.is_empty() {
            return Err(DbError::invalid_state(
                "bucket must have at least one source folder",
            ));
        }
        if new.destination_folder.trim().is_empty() {
            return Err(DbError::invalid_state(
                "bucket must have a destination folder",
            ));
        }
        if new.worker_count == 0 {
            return Err(DbError::invalid_state("worker count must be at least 1"));
        }

        let now = Self::now_millis();
        let folders = serde_json::to_string(&new.source_folders)?;

        let result = sqlx::query(
            r#"
            INSERT INTO buckets (name, source_folders, destination_folder, worker_count, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.name)
        .bind(&folders)
        .bind(&new.destination_folder)
        .bind(new.worker_count as i64)
        .bind(BucketStatus::Stopped.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| map_unique(e, &format!("bucket '{}'", new.name)))?;

        self.get_bucket(result.last_insert_rowid()).await
    }

    pub async fn get_bucket(&self, id: i64) -> Result<Bucket> {
        let row = sqlx::query("SELECT * FROM buckets WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DbError::not_found(format!("bucket {id}")))?;
        row_to_bucket(&row)
    }

    pub async fn get_bucket_by_name(&self, name: &str) -> Result<Bucket> {
        let row = sqlx::query("SELECT * FROM buckets WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DbError::not_found(format!("bucket '{name}'")))?;
        row_to_bucket(&row)
    }

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        let rows = sqlx::query("SELECT * FROM buckets ORDER BY id ASC")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(row_to_bucket).collect()
    }

    /// Apply a partial update. Source list and destination may only change
    /// while the bucket is stopped; the worker cap changes live.
    pub async fn update_bucket(&self, id: i64, update: &BucketUpdate) -> Result<Bucket> {
        let current = self.get_bucket(id).await?;

        if update.changes_layout() && current.status != BucketStatus::Stopped {
            return Err(DbError::invalid_state(format!(
                "bucket {id} must be stopped to change sources or destination"
            )));
        }
        if let Some(count) = update.worker_count {
            if count == 0 {
                return Err(DbError::invalid_state("worker count must be at least 1"));
            }
        }

        let name = update.name.clone().unwrap_or(current.name);
        let sources = update
            .source_folders
            .clone()
            .unwrap_or(current.source_folders);
        let destination = update
            .destination_folder
            .clone()
            .unwrap_or(current.destination_folder);
        let worker_count = update.worker_count.unwrap_or(current.worker_count);

        if sources.is_empty() {
            return Err(DbError::invalid_state(
                "bucket must have at least one source folder",
            ));
        }

        sqlx::query(
            r#"
            UPDATE buckets
            SET name = ?, source_folders = ?, destination_folder = ?, worker_count = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&name)
        .bind(serde_json::to_string(&sources)?)
        .bind(&destination)
        .bind(worker_count as i64)
        .bind(Self::now_millis())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| map_unique(e, &format!("bucket '{name}'")))?;

        self.get_bucket(id).await
    }

    /// Persist the scheduler status so it survives restarts.
    pub async fn set_bucket_status(&self, id: i64, status: BucketStatus) -> Result<()> {
        let updated = sqlx::query("UPDATE buckets SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Self::now_millis())
            .bind(id)
            .execute(self.pool())
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(DbError::not_found(format!("bucket {id}")));
        }
        Ok(())
    }

    /// Delete a stopped bucket and all of its queue rows. The ledger is
    /// adjusted by a delta read in the same transaction as the delete.
    pub async fn delete_bucket(&self, id: i64) -> Result<()> {
        let bucket = self.get_bucket(id).await?;
        if bucket.status != BucketStatus::Stopped {
            return Err(DbError::invalid_state(format!(
                "bucket {id} must be stopped before deletion"
            )));
        }

        let mut ledger = self.ledger.lock().await;
        let mut tx = self.pool().begin().await?;

        let delta = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS cnt, COALESCE(SUM(file_size), 0) AS total
            FROM file_queue WHERE bucket_id = ?
            GROUP BY status
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM file_queue WHERE bucket_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        for row in &delta {
            let status_str: String = row.get("status");
            let status = FileStatus::parse(&status_str).ok_or_else(|| {
                DbError::invalid_state(format!("unknown queue status: {status_str}"))
            })?;
            ledger.remove(
                id,
                status,
                row.get::<i64, _>("cnt").max(0) as u64,
                row.get::<i64, _>("total").max(0) as u64,
            );
        }
        ledger.drop_bucket(id);
        self.invalidate_folder_stats(id);

        Ok(())
    }
}
