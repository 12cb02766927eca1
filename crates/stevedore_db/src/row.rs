//! Row-to-record mapping.

use crate::error::{DbError, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use stevedore_protocol::types::{Bucket, BucketStatus, FileStatus, QueueEntry};

pub(crate) fn row_to_entry(row: &SqliteRow) -> Result<QueueEntry> {
    let status_str: String = row.get("status");
    let status = FileStatus::parse(&status_str)
        .ok_or_else(|| DbError::invalid_state(format!("unknown queue status: {status_str}")))?;

    Ok(QueueEntry {
        id: row.get("id"),
        bucket_id: row.get("bucket_id"),
        source_path: row.get("source_path"),
        source_folder: row.get("source_folder"),
        relative_path: row.get("relative_path"),
        destination_path: row.get("destination_path"),
        file_size: row.get::<i64, _>("file_size").max(0) as u64,
        source_hash: row.get("source_hash"),
        destination_hash: row.get("destination_hash"),
        status,
        error_message: row.get("error_message"),
        worker_id: row.get("worker_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

pub(crate) fn row_to_bucket(row: &SqliteRow) -> Result<Bucket> {
    let status_str: String = row.get("status");
    let status = BucketStatus::parse(&status_str)
        .ok_or_else(|| DbError::invalid_state(format!("unknown bucket status: {status_str}")))?;

    let folders_json: String = row.get("source_folders");
    let source_folders: Vec<String> = serde_json::from_str(&folders_json)?;

    Ok(Bucket {
        id: row.get("id"),
        name: row.get("name"),
        source_folders,
        destination_folder: row.get("destination_folder"),
        worker_count: row.get::<i64, _>("worker_count").max(0) as u32,
        status,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
