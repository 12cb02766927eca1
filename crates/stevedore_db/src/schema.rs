//! Schema creation and forward migrations.
//!
//! The `schema_version` key in `service_state` gates migration: a fresh
//! database gets the current schema directly, an older database is walked
//! forward one version at a time, and a newer database is refused.

use crate::error::{DbError, Result};
use sqlx::{Row, SqlitePool};
use tracing::info;

/// Current schema version. Increment together with a new migration step.
pub const SCHEMA_VERSION: i32 = 2;

const SCHEMA_VERSION_KEY: &str = "schema_version";

pub(crate) async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    // service_state must exist before we can read the version out of it.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS service_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    match current_version(pool).await? {
        None => {
            create_current_schema(pool).await?;
            set_version(pool, SCHEMA_VERSION).await?;
            info!(version = SCHEMA_VERSION, "created queue schema");
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) if v < SCHEMA_VERSION => {
            for target in (v + 1)..=SCHEMA_VERSION {
                apply_migration(pool, target).await?;
                set_version(pool, target).await?;
                info!(from = target - 1, to = target, "applied schema migration");
            }
        }
        Some(v) => {
            return Err(DbError::invalid_state(format!(
                "database schema version {v} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
    }

    Ok(())
}

async fn current_version(pool: &SqlitePool) -> Result<Option<i32>> {
    let row = sqlx::query("SELECT value FROM service_state WHERE key = ?")
        .bind(SCHEMA_VERSION_KEY)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let raw: String = row.get("value");
            let version = raw.parse::<i32>().map_err(|_| {
                DbError::invalid_state(format!("unreadable schema version: {raw}"))
            })?;
            Ok(Some(version))
        }
        // An unversioned database that already has queue tables predates
        // versioning entirely: treat it as v1 and migrate forward.
        None => {
            if table_exists(pool, "file_queue").await? {
                Ok(Some(1))
            } else {
                Ok(None)
            }
        }
    }
}

async fn set_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO service_state (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(SCHEMA_VERSION_KEY)
    .bind(version.to_string())
    .bind(crate::QueueDb::now_millis())
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_current_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS buckets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            source_folders TEXT NOT NULL,
            destination_folder TEXT NOT NULL,
            worker_count INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'stopped',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS file_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bucket_id INTEGER NOT NULL REFERENCES buckets(id) ON DELETE CASCADE,
            source_path TEXT NOT NULL,
            source_folder TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            destination_path TEXT NOT NULL,
            file_size INTEGER NOT NULL DEFAULT 0,
            source_hash TEXT,
            destination_hash TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            worker_id INTEGER,
            UNIQUE(source_path, destination_path, bucket_id)
        )"#,
    )
    .execute(pool)
    .await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_queue_claim ON file_queue(bucket_id, status, source_folder, id)",
        "CREATE INDEX IF NOT EXISTS idx_queue_status_updated ON file_queue(status, updated_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_queue_bucket_updated ON file_queue(bucket_id, updated_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_queue_updated ON file_queue(updated_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_queue_folder ON file_queue(source_folder)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

/// One forward step per target version. Steps are additive and idempotent.
async fn apply_migration(pool: &SqlitePool, target: i32) -> Result<()> {
    match target {
        // v1 shipped before per-claim worker attribution and the
        // folder-scan index existed.
        2 => {
            if !column_exists(pool, "file_queue", "worker_id").await? {
                sqlx::query("ALTER TABLE file_queue ADD COLUMN worker_id INTEGER")
                    .execute(pool)
                    .await?;
            }
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_queue_folder ON file_queue(source_folder)",
            )
            .execute(pool)
            .await?;
            Ok(())
        }
        other => Err(DbError::invalid_state(format!(
            "no migration step for schema version {other}"
        ))),
    }
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let row = sqlx::query("SELECT COUNT(*) AS cnt FROM pragma_table_info(?) WHERE name = ?")
        .bind(table)
        .bind(column)
        .fetch_one(pool)
        .await?;
    Ok(row.get::<i64, _>("cnt") > 0)
}
