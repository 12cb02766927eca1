//! Core records and lifecycle enums.
//!
//! These types are the single source of truth for the queue store, the
//! schedulers, and the control plane.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Lifecycle enums
// ============================================================================

/// Status of a queue entry.
///
/// Lifecycle: `pending → in_progress → {completed | error | conflict}`,
/// plus operator-driven `conflict → {pending, completed}` and
/// `error → pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Completed,
    Error,
    Conflict,
}

impl FileStatus {
    pub const ALL: [FileStatus; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Error,
        Self::Conflict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "conflict" => Some(Self::Conflict),
            _ => None,
        }
    }

    /// Terminal states leave only through operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Conflict)
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operational status of a bucket's scheduler, persisted in the bucket row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketStatus {
    Stopped,
    Running,
    Paused,
}

impl BucketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(Self::Stopped),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

impl std::fmt::Display for BucketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operator decision applied to a row in `conflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    /// Requeue the row; the destination will be replaced on the next copy.
    Overwrite,
    /// Keep the destination as-is and mark the row completed.
    Skip,
}

impl ConflictAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Skip => "skip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "overwrite" => Some(Self::Overwrite),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

/// Content-hash algorithm used for verification.
///
/// Source and destination hashes for one row always come from the same
/// algorithm; the comparison is byte-for-byte on the hex digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Xxhash64,
    #[default]
    Xxhash3,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Xxhash64 => "xxhash64",
            Self::Xxhash3 => "xxhash3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(Self::Sha256),
            "xxhash64" => Some(Self::Xxhash64),
            "xxhash3" => Some(Self::Xxhash3),
            _ => None,
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Bucket records
// ============================================================================

/// A bucket: ordered source roots replicated into one destination root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub id: i64,
    pub name: String,
    /// Absolute paths, in drain order.
    pub source_folders: Vec<String>,
    pub destination_folder: String,
    /// Configured worker cap for this bucket's scheduler.
    pub worker_count: u32,
    pub status: BucketStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Payload for bucket creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBucket {
    pub name: String,
    pub source_folders: Vec<String>,
    pub destination_folder: String,
    pub worker_count: u32,
}

/// Partial bucket update. `None` fields are left untouched.
///
/// Source list and destination may only change while the scheduler is
/// stopped; the worker cap applies live to subsequent claims.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketUpdate {
    pub name: Option<String>,
    pub source_folders: Option<Vec<String>>,
    pub destination_folder: Option<String>,
    pub worker_count: Option<u32>,
}

impl BucketUpdate {
    /// True when the update touches fields that require a stopped scheduler.
    pub fn changes_layout(&self) -> bool {
        self.source_folders.is_some() || self.destination_folder.is_some()
    }
}

// ============================================================================
// Queue records
// ============================================================================

/// One durable row of the file queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: i64,
    pub bucket_id: i64,
    pub source_path: String,
    /// The source root this file was enumerated under.
    pub source_folder: String,
    pub relative_path: String,
    pub destination_path: String,
    pub file_size: u64,
    pub source_hash: Option<String>,
    pub destination_hash: Option<String>,
    pub status: FileStatus,
    pub error_message: Option<String>,
    pub worker_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Row payload produced by the scanner.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub source_path: String,
    pub source_folder: String,
    pub relative_path: String,
    pub destination_path: String,
    pub file_size: u64,
    /// Normally `Pending`; the opt-in scanner fast path may insert
    /// `Completed` for same-size pre-existing destinations.
    pub status: FileStatus,
}

/// Pending / in-progress counts for one source folder, used by the
/// scheduler's folder-selection step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderActivity {
    pub pending: u64,
    pub in_progress: u64,
}

impl FolderActivity {
    pub fn is_active(&self) -> bool {
        self.pending > 0 || self.in_progress > 0
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Aggregate for one (scope, status) cell of the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTotals {
    pub count: u64,
    pub total_size: u64,
}

/// Per-status totals for one scope (global or one bucket).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeStats {
    pub pending: StatusTotals,
    pub in_progress: StatusTotals,
    pub completed: StatusTotals,
    pub error: StatusTotals,
    pub conflict: StatusTotals,
}

impl ScopeStats {
    pub fn get(&self, status: FileStatus) -> StatusTotals {
        match status {
            FileStatus::Pending => self.pending,
            FileStatus::InProgress => self.in_progress,
            FileStatus::Completed => self.completed,
            FileStatus::Error => self.error,
            FileStatus::Conflict => self.conflict,
        }
    }

    pub fn get_mut(&mut self, status: FileStatus) -> &mut StatusTotals {
        match status {
            FileStatus::Pending => &mut self.pending,
            FileStatus::InProgress => &mut self.in_progress,
            FileStatus::Completed => &mut self.completed,
            FileStatus::Error => &mut self.error,
            FileStatus::Conflict => &mut self.conflict,
        }
    }

    pub fn is_empty(&self) -> bool {
        FileStatus::ALL.iter().all(|s| self.get(*s).count == 0)
    }
}

/// Snapshot of the stats ledger: global scope plus per bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total: ScopeStats,
    pub buckets: HashMap<i64, ScopeStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_status_round_trips() {
        for status in FileStatus::ALL {
            assert_eq!(FileStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FileStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!FileStatus::Pending.is_terminal());
        assert!(!FileStatus::InProgress.is_terminal());
        assert!(FileStatus::Completed.is_terminal());
        assert!(FileStatus::Error.is_terminal());
        assert!(FileStatus::Conflict.is_terminal());
    }

    #[test]
    fn hash_algorithm_parse() {
        assert_eq!(HashAlgorithm::parse("sha256"), Some(HashAlgorithm::Sha256));
        assert_eq!(
            HashAlgorithm::parse("xxhash64"),
            Some(HashAlgorithm::Xxhash64)
        );
        assert_eq!(HashAlgorithm::parse("xxhash3"), Some(HashAlgorithm::Xxhash3));
        assert_eq!(HashAlgorithm::parse("md5"), None);
    }

    #[test]
    fn scope_stats_cells_are_independent() {
        let mut stats = ScopeStats::default();
        stats.get_mut(FileStatus::Pending).count = 3;
        stats.get_mut(FileStatus::Pending).total_size = 30;
        stats.get_mut(FileStatus::Completed).count = 1;

        assert_eq!(stats.get(FileStatus::Pending).count, 3);
        assert_eq!(stats.get(FileStatus::Completed).total_size, 0);
        assert_eq!(stats.get(FileStatus::Error).count, 0);
        assert!(!stats.is_empty());
    }
}
