//! File-queue operations: seeding, claim, commit, conflict resolution,
//! retry, crash recovery, and per-folder aggregates.
//!
//! Every mutation runs in one transaction while the store's write lock is
//! held; the ledger delta is applied before the lock is released.

use crate::error::{DbError, Result};
use crate::row::row_to_entry;
use crate::QueueDb;
use sqlx::Row;
use std::collections::HashMap;
use std::time::Instant;
use stevedore_protocol::types::{
    ConflictAction, FileStatus, FolderActivity, NewQueueEntry, QueueEntry, ScopeStats,
};

/// Optional fields recorded alongside a terminal status.
#[derive(Debug, Clone, Default)]
pub struct CommitExtras {
    pub source_hash: Option<String>,
    pub destination_hash: Option<String>,
    pub error_message: Option<String>,
}

/// Filter for the browse operations.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub bucket_id: Option<i64>,
    pub status: Option<FileStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl QueueDb {
    // ========================================================================
    // Seeding
    // ========================================================================

    /// Bulk-insert rows, deduplicating on the
    /// (source path, destination path, bucket) triple. Reinsertion of an
    /// existing triple is a no-op. Returns the number of rows actually added.
    pub async fn insert_many(&self, bucket_id: i64, entries: &[NewQueueEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut ledger = self.ledger.lock().await;
        let mut tx = self.pool().begin().await?;
        let now = Self::now_millis();

        let mut added = 0u64;
        let mut deltas: HashMap<FileStatus, (u64, u64)> = HashMap::new();

        for entry in entries {
            // The opt-in scanner fast path may seed rows directly as
            // completed; everything else arrives pending.
            let completed_at = match entry.status {
                FileStatus::Completed => Some(now),
                _ => None,
            };
            let result = sqlx::query(
                r#"
                INSERT INTO file_queue (
                    bucket_id, source_path, source_folder, relative_path,
                    destination_path, file_size, status, created_at, updated_at, completed_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(source_path, destination_path, bucket_id) DO NOTHING
                "#,
            )
            .bind(bucket_id)
            .bind(&entry.source_path)
            .bind(&entry.source_folder)
            .bind(&entry.relative_path)
            .bind(&entry.destination_path)
            .bind(entry.file_size as i64)
            .bind(entry.status.as_str())
            .bind(now)
            .bind(now)
            .bind(completed_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                added += 1;
                let delta = deltas.entry(entry.status).or_default();
                delta.0 += 1;
                delta.1 += entry.file_size;
            }
        }

        tx.commit().await?;

        for (status, (count, size)) in deltas {
            ledger.add(bucket_id, status, count, size);
        }
        self.invalidate_folder_stats(bucket_id);

        Ok(added)
    }

    // ========================================================================
    // Claim / commit
    // ========================================================================

    /// Claim up to `limit` pending rows for a bucket, oldest first
    /// (ascending row id). When `folder` is given, only rows enumerated
    /// under that source root are considered.
    ///
    /// Each candidate is transitioned by an update guarded on its current
    /// status; a row that was taken or removed in the meantime is skipped
    /// silently. Returns the rows that actually transitioned.
    pub async fn claim(
        &self,
        bucket_id: i64,
        folder: Option<&str>,
        limit: u32,
        worker_id: i64,
    ) -> Result<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut ledger = self.ledger.lock().await;
        let mut tx = self.pool().begin().await?;
        let now = Self::now_millis();

        let candidates = match folder {
            Some(folder) => {
                sqlx::query(
                    r#"
                    SELECT id FROM file_queue
                    WHERE bucket_id = ? AND status = 'pending' AND source_folder = ?
                    ORDER BY id ASC
                    LIMIT ?
                    "#,
                )
                .bind(bucket_id)
                .bind(folder)
                .bind(limit)
                .fetch_all(&mut *tx)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id FROM file_queue
                    WHERE bucket_id = ? AND status = 'pending'
                    ORDER BY id ASC
                    LIMIT ?
                    "#,
                )
                .bind(bucket_id)
                .bind(limit)
                .fetch_all(&mut *tx)
                .await?
            }
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for row in candidates {
            let id: i64 = row.get("id");
            let updated = sqlx::query(
                r#"
                UPDATE file_queue
                SET status = 'in_progress', worker_id = ?, started_at = ?, updated_at = ?
                WHERE id = ? AND status = 'pending'
                "#,
            )
            .bind(worker_id)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() != 1 {
                continue;
            }

            let row = sqlx::query("SELECT * FROM file_queue WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            claimed.push(row_to_entry(&row)?);
        }

        tx.commit().await?;

        for entry in &claimed {
            ledger.transition(
                bucket_id,
                FileStatus::Pending,
                FileStatus::InProgress,
                1,
                entry.file_size,
            );
        }
        if !claimed.is_empty() {
            self.invalidate_folder_stats(bucket_id);
        }

        Ok(claimed)
    }

    /// Record a worker outcome: set the terminal status plus any hashes,
    /// error message, and the completion timestamp.
    ///
    /// The row's current status is fetched in the same transaction so the
    /// ledger delta is exact. Lookups are scoped to (bucket, row).
    pub async fn commit_outcome(
        &self,
        bucket_id: i64,
        row_id: i64,
        new_status: FileStatus,
        extras: CommitExtras,
    ) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        let mut tx = self.pool().begin().await?;
        let now = Self::now_millis();

        let meta = sqlx::query("SELECT status, file_size FROM file_queue WHERE id = ? AND bucket_id = ?")
            .bind(row_id)
            .bind(bucket_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                DbError::not_found(format!("queue entry {row_id} in bucket {bucket_id}"))
            })?;

        let old_status_str: String = meta.get("status");
        let old_status = FileStatus::parse(&old_status_str).ok_or_else(|| {
            DbError::invalid_state(format!("unknown queue status: {old_status_str}"))
        })?;
        let file_size = meta.get::<i64, _>("file_size").max(0) as u64;

        let completed_at = if new_status.is_terminal() {
            Some(now)
        } else {
            None
        };

        sqlx::query(
            r#"
            UPDATE file_queue
            SET status = ?, source_hash = ?, destination_hash = ?,
                error_message = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND bucket_id = ? AND status = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(extras.source_hash.as_deref())
        .bind(extras.destination_hash.as_deref())
        .bind(extras.error_message.as_deref())
        .bind(completed_at)
        .bind(now)
        .bind(row_id)
        .bind(bucket_id)
        .bind(old_status.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        ledger.transition(bucket_id, old_status, new_status, 1, file_size);
        self.invalidate_folder_stats(bucket_id);

        Ok(())
    }

    // ========================================================================
    // Operator actions
    // ========================================================================

    /// Resolve one conflicted row. `Overwrite` requeues it with the stale
    /// destination hash cleared; `Skip` marks it completed as-is.
    ///
    /// Returns `false` (without error) when the row is not in `conflict`.
    pub async fn resolve_conflict(
        &self,
        bucket_id: i64,
        row_id: i64,
        action: ConflictAction,
    ) -> Result<bool> {
        let mut ledger = self.ledger.lock().await;
        let mut tx = self.pool().begin().await?;
        let now = Self::now_millis();

        let meta = sqlx::query(
            "SELECT file_size FROM file_queue WHERE id = ? AND bucket_id = ? AND status = 'conflict'",
        )
        .bind(row_id)
        .bind(bucket_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(meta) = meta else {
            return Ok(false);
        };
        let file_size = meta.get::<i64, _>("file_size").max(0) as u64;

        let new_status = match action {
            ConflictAction::Overwrite => {
                sqlx::query(
                    r#"
                    UPDATE file_queue
                    SET status = 'pending', destination_hash = NULL, worker_id = NULL,
                        started_at = NULL, completed_at = NULL, updated_at = ?
                    WHERE id = ? AND status = 'conflict'
                    "#,
                )
                .bind(now)
                .bind(row_id)
                .execute(&mut *tx)
                .await?;
                FileStatus::Pending
            }
            ConflictAction::Skip => {
                sqlx::query(
                    r#"
                    UPDATE file_queue
                    SET status = 'completed', completed_at = ?, updated_at = ?
                    WHERE id = ? AND status = 'conflict'
                    "#,
                )
                .bind(now)
                .bind(now)
                .bind(row_id)
                .execute(&mut *tx)
                .await?;
                FileStatus::Completed
            }
        };

        tx.commit().await?;

        ledger.transition(bucket_id, FileStatus::Conflict, new_status, 1, file_size);
        self.invalidate_folder_stats(bucket_id);

        Ok(true)
    }

    /// Resolve every conflicted row, optionally scoped to one bucket.
    /// Returns the number of rows transitioned.
    pub async fn resolve_conflicts_bulk(
        &self,
        bucket_id: Option<i64>,
        action: ConflictAction,
    ) -> Result<u64> {
        let new_status = match action {
            ConflictAction::Overwrite => FileStatus::Pending,
            ConflictAction::Skip => FileStatus::Completed,
        };
        self.bulk_transition(bucket_id, FileStatus::Conflict, new_status)
            .await
    }

    /// Requeue one errored row. Returns `false` when the row is not in
    /// `error`.
    pub async fn retry_error(&self, bucket_id: i64, row_id: i64) -> Result<bool> {
        let mut ledger = self.ledger.lock().await;
        let mut tx = self.pool().begin().await?;
        let now = Self::now_millis();

        let meta = sqlx::query(
            "SELECT file_size FROM file_queue WHERE id = ? AND bucket_id = ? AND status = 'error'",
        )
        .bind(row_id)
        .bind(bucket_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(meta) = meta else {
            return Ok(false);
        };
        let file_size = meta.get::<i64, _>("file_size").max(0) as u64;

        sqlx::query(
            r#"
            UPDATE file_queue
            SET status = 'pending', source_hash = NULL, destination_hash = NULL,
                error_message = NULL, worker_id = NULL,
                started_at = NULL, completed_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'error'
            "#,
        )
        .bind(now)
        .bind(row_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        ledger.transition(bucket_id, FileStatus::Error, FileStatus::Pending, 1, file_size);
        self.invalidate_folder_stats(bucket_id);

        Ok(true)
    }

    /// Requeue every errored row, optionally scoped to one bucket.
    pub async fn retry_errors_bulk(&self, bucket_id: Option<i64>) -> Result<u64> {
        self.bulk_transition(bucket_id, FileStatus::Error, FileStatus::Pending)
            .await
    }

    /// Shared body for the bulk operator actions: the per-bucket delta is
    /// read in the same transaction as the update so the ledger stays exact.
    async fn bulk_transition(
        &self,
        bucket_id: Option<i64>,
        from: FileStatus,
        to: FileStatus,
    ) -> Result<u64> {
        let mut ledger = self.ledger.lock().await;
        let mut tx = self.pool().begin().await?;
        let now = Self::now_millis();

        let delta_rows = match bucket_id {
            Some(bucket) => {
                sqlx::query(
                    r#"
                    SELECT bucket_id, COUNT(*) AS cnt, COALESCE(SUM(file_size), 0) AS total
                    FROM file_queue WHERE status = ? AND bucket_id = ?
                    GROUP BY bucket_id
                    "#,
                )
                .bind(from.as_str())
                .bind(bucket)
                .fetch_all(&mut *tx)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT bucket_id, COUNT(*) AS cnt, COALESCE(SUM(file_size), 0) AS total
                    FROM file_queue WHERE status = ?
                    GROUP BY bucket_id
                    "#,
                )
                .bind(from.as_str())
                .fetch_all(&mut *tx)
                .await?
            }
        };

        if delta_rows.is_empty() {
            return Ok(0);
        }

        // conflict -> pending keeps the source hash: it marks the row as
        // requeued by an overwrite resolution. error -> pending clears
        // both hashes for a clean re-verify.
        let (completed_at_set, clear_sql) = match (from, to) {
            (_, FileStatus::Completed) => ("completed_at = ?,", ""),
            (FileStatus::Conflict, _) => (
                "completed_at = NULL,",
                "destination_hash = NULL, error_message = NULL, worker_id = NULL, started_at = NULL,",
            ),
            _ => (
                "completed_at = NULL,",
                "source_hash = NULL, destination_hash = NULL, error_message = NULL, worker_id = NULL, started_at = NULL,",
            ),
        };

        let update_sql = format!(
            "UPDATE file_queue SET status = ?, {clear_sql} {completed_at_set} updated_at = ? \
             WHERE status = ?{}",
            if bucket_id.is_some() {
                " AND bucket_id = ?"
            } else {
                ""
            }
        );

        let mut query = sqlx::query(&update_sql).bind(to.as_str());
        if to == FileStatus::Completed {
            query = query.bind(now);
        }
        query = query.bind(now).bind(from.as_str());
        if let Some(bucket) = bucket_id {
            query = query.bind(bucket);
        }
        let updated = query.execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;

        for row in &delta_rows {
            let bucket: i64 = row.get("bucket_id");
            let count = row.get::<i64, _>("cnt").max(0) as u64;
            let total = row.get::<i64, _>("total").max(0) as u64;
            ledger.transition(bucket, from, to, count, total);
            self.invalidate_folder_stats(bucket);
        }

        Ok(updated)
    }

    // ========================================================================
    // Crash recovery
    // ========================================================================

    /// Revert every `in_progress` row to `pending`, clearing worker
    /// attribution. Run once at startup before the ledger is rebuilt, so
    /// that no row survives a crash mid-copy.
    pub(crate) async fn recover_interrupted(&self) -> Result<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE file_queue
            SET status = 'pending', worker_id = NULL, started_at = NULL, updated_at = ?
            WHERE status = 'in_progress'
            "#,
        )
        .bind(Self::now_millis())
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(updated)
    }

    // ========================================================================
    // Aggregates and browsing
    // ========================================================================

    /// `{folder → {pending, in_progress}}` for one bucket. Cheap via the
    /// (bucket, status, folder) index; the scheduler uses it to pick the
    /// folder to drain next.
    pub async fn folder_active_counts(
        &self,
        bucket_id: i64,
    ) -> Result<HashMap<String, FolderActivity>> {
        let rows = sqlx::query(
            r#"
            SELECT source_folder,
                   SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending,
                   SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END) AS in_progress
            FROM file_queue
            WHERE bucket_id = ? AND status IN ('pending', 'in_progress')
            GROUP BY source_folder
            "#,
        )
        .bind(bucket_id)
        .fetch_all(self.pool())
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(
                row.get::<String, _>("source_folder"),
                FolderActivity {
                    pending: row.get::<i64, _>("pending").max(0) as u64,
                    in_progress: row.get::<i64, _>("in_progress").max(0) as u64,
                },
            );
        }
        Ok(out)
    }

    /// Per-folder breakdown by status for one bucket, cached with a short
    /// TTL to absorb operator polling.
    pub async fn folder_stats(&self, bucket_id: i64) -> Result<HashMap<String, ScopeStats>> {
        if let Ok(cache) = self.folder_stats_cache().lock() {
            if let Some((at, stats)) = cache.get(&bucket_id) {
                if at.elapsed() < Self::folder_stats_ttl() {
                    return Ok(stats.clone());
                }
            }
        }

        let rows = sqlx::query(
            r#"
            SELECT source_folder, status, COUNT(*) AS cnt, COALESCE(SUM(file_size), 0) AS total
            FROM file_queue
            WHERE bucket_id = ?
            GROUP BY source_folder, status
            "#,
        )
        .bind(bucket_id)
        .fetch_all(self.pool())
        .await?;

        let mut out: HashMap<String, ScopeStats> = HashMap::new();
        for row in rows {
            let status_str: String = row.get("status");
            let status = FileStatus::parse(&status_str).ok_or_else(|| {
                DbError::invalid_state(format!("unknown queue status: {status_str}"))
            })?;
            let cell = out
                .entry(row.get::<String, _>("source_folder"))
                .or_default()
                .get_mut(status);
            cell.count = row.get::<i64, _>("cnt").max(0) as u64;
            cell.total_size = row.get::<i64, _>("total").max(0) as u64;
        }

        if let Ok(mut cache) = self.folder_stats_cache().lock() {
            cache.insert(bucket_id, (Instant::now(), out.clone()));
        }
        Ok(out)
    }

    /// Fetch one entry, scoped to its bucket.
    pub async fn get_entry(&self, bucket_id: i64, row_id: i64) -> Result<Option<QueueEntry>> {
        let row = sqlx::query("SELECT * FROM file_queue WHERE id = ? AND bucket_id = ?")
            .bind(row_id)
            .bind(bucket_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_entry).transpose()
    }

    /// List entries newest-updated first. Read-only; no ledger effect.
    pub async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<QueueEntry>> {
        let mut sql = String::from("SELECT * FROM file_queue WHERE 1 = 1");
        if filter.bucket_id.is_some() {
            sql.push_str(" AND bucket_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(bucket) = filter.bucket_id {
            query = query.bind(bucket);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        query = query
            .bind(filter.limit.unwrap_or(100))
            .bind(filter.offset.unwrap_or(0));

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(row_to_entry).collect()
    }

    fn folder_stats_cache(
        &self,
    ) -> &std::sync::Mutex<HashMap<i64, (Instant, HashMap<String, ScopeStats>)>> {
        &self.folder_stats
    }
}
