//! Durable queue store for the stevedore replication service.
//!
//! `QueueDb` is the sole authority on durable state: buckets, file-queue
//! rows, and service state all mutate through it in atomic transactions.
//! The in-memory stats ledger is adjusted under the same lock that
//! serializes those transactions, so ledger and durable state never
//! diverge within a single process.

mod buckets;
mod error;
mod ledger;
mod queue;
mod row;
mod schema;
mod state;

pub use error::{DbError, Result};
pub use queue::{CommitExtras, EntryFilter};
pub use schema::SCHEMA_VERSION;

use ledger::StatsLedger;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use stevedore_protocol::types::{ScopeStats, StatsSnapshot};
use tokio::sync::Mutex;
use tracing::info;

/// How long a per-folder stats snapshot stays fresh. Absorbs
/// operator-driven polling without hitting the queue table each time.
const FOLDER_STATS_TTL_MS: u64 = 2_000;

type FolderStatsCache = HashMap<i64, (Instant, HashMap<String, ScopeStats>)>;

/// Handle to the queue database. Clone is cheap and shares state.
#[derive(Clone)]
pub struct QueueDb {
    pool: SqlitePool,
    /// Stats ledger. The mutex doubles as the write lock: every mutating
    /// transaction runs while holding it, and applies its ledger delta
    /// before releasing.
    ledger: Arc<Mutex<StatsLedger>>,
    folder_stats: Arc<std::sync::Mutex<FolderStatsCache>>,
}

impl QueueDb {
    /// Open (or create) the queue database at the given path.
    ///
    /// Runs schema creation and forward migrations, startup crash
    /// recovery (`in_progress → pending`), and rebuilds the stats ledger
    /// from the queue table before returning.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // WAL for concurrent readers; the busy timeout covers writer
        // overlap. Options apply to every pooled connection.
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        schema::ensure_schema(&pool).await?;

        let db = Self {
            pool,
            ledger: Arc::new(Mutex::new(StatsLedger::default())),
            folder_stats: Arc::new(std::sync::Mutex::new(HashMap::new())),
        };

        let recovered = db.recover_interrupted().await?;
        if recovered > 0 {
            info!(recovered, "reverted interrupted rows to pending");
        }
        db.rebuild_ledger().await?;

        info!(path = %path.display(), "queue database opened");
        Ok(db)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current time as milliseconds since the Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Snapshot of the stats ledger. O(1) with respect to the queue table.
    pub async fn stats(&self) -> StatsSnapshot {
        self.ledger.lock().await.snapshot()
    }

    /// Ledger slice for one bucket.
    pub async fn bucket_stats(&self, bucket_id: i64) -> ScopeStats {
        self.ledger
            .lock()
            .await
            .snapshot()
            .buckets
            .get(&bucket_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Rebuild the ledger from one GROUP BY over the queue table.
    ///
    /// Under steady state this is a no-op; it is the oracle whenever
    /// divergence is suspected.
    pub async fn rebuild_ledger(&self) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        let rows = self.aggregate_ground_truth().await?;
        ledger.replace(rows);
        Ok(())
    }

    /// Compare the ledger against the ground-truth aggregate.
    pub async fn verify_ledger(&self) -> Result<bool> {
        let ledger = self.ledger.lock().await;
        let mut oracle = StatsLedger::default();
        oracle.replace(self.aggregate_ground_truth().await?);
        Ok(ledger.matches(&oracle))
    }

    async fn aggregate_ground_truth(&self) -> Result<Vec<ledger::AggregateRow>> {
        use sqlx::Row;
        let rows = sqlx::query(
            r#"
            SELECT bucket_id, status, COUNT(*) AS cnt, COALESCE(SUM(file_size), 0) AS total
            FROM file_queue
            GROUP BY bucket_id, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status_str: String = row.get("status");
            let status = stevedore_protocol::FileStatus::parse(&status_str).ok_or_else(|| {
                DbError::invalid_state(format!("unknown queue status: {status_str}"))
            })?;
            out.push(ledger::AggregateRow {
                bucket_id: row.get::<i64, _>("bucket_id"),
                status,
                count: row.get::<i64, _>("cnt").max(0) as u64,
                total_size: row.get::<i64, _>("total").max(0) as u64,
            });
        }
        Ok(out)
    }

    pub(crate) fn invalidate_folder_stats(&self, bucket_id: i64) {
        if let Ok(mut cache) = self.folder_stats.lock() {
            cache.remove(&bucket_id);
        }
    }

    pub(crate) fn folder_stats_ttl() -> std::time::Duration {
        std::time::Duration::from_millis(FOLDER_STATS_TTL_MS)
    }
}
