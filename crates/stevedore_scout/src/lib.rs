//! Source-root scanner.
//!
//! Enumerates regular files under each of a bucket's source roots,
//! computes the mirrored destination path for each, and seeds the queue
//! through the store's deduplicating bulk insert.

mod patterns;

pub use patterns::IgnoreSet;

use std::path::{Path, PathBuf};
use stevedore_db::QueueDb;
use stevedore_protocol::types::{Bucket, FileStatus, NewQueueEntry};
use stevedore_protocol::{paths, ServiceConfig};
use thiserror::Error;
use tracing::{info, warn};

/// Rows per bulk insert while seeding.
const SEED_BATCH_SIZE: usize = 500;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("source root does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("source root is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("invalid ignore pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("scan task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Db(#[from] stevedore_db::DbError),
}

/// Scanner options, derived from the recognized service configuration.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Descend into subdirectories.
    pub recursive: bool,
    /// Glob patterns excluded from enumeration.
    pub ignore_patterns: Vec<String>,
    /// Opt-in fast path: seed rows whose destination already exists with
    /// equal size directly as completed, skipping the worker's hash
    /// check. Equal size is not equal content; off by default.
    pub precomplete_existing: bool,
}

impl ScanConfig {
    pub fn from_service(config: &ServiceConfig) -> Self {
        Self {
            recursive: config.scan_recursive,
            ignore_patterns: config.scan_ignore_patterns.clone(),
            precomplete_existing: false,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            ignore_patterns: Vec::new(),
            precomplete_existing: false,
        }
    }
}

/// Result of one bucket scan.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    /// Regular files enumerated across all source roots.
    pub files_seen: u64,
    /// Rows actually added to the queue (dedup makes rescans cheap).
    pub files_queued: u64,
    /// Entries skipped: symlinks, unreadable entries, ignore matches.
    pub skipped: u64,
}

/// Enumerate every source root of a bucket and seed the queue.
///
/// Roots are walked in the bucket's source-list order; a missing root is
/// an error rather than a silent empty scan.
pub async fn scan_bucket(db: &QueueDb, bucket: &Bucket, config: &ScanConfig) -> Result<ScanSummary> {
    let ignore = IgnoreSet::build(&config.ignore_patterns)?;
    let destination_root = PathBuf::from(&bucket.destination_folder);
    let mut summary = ScanSummary::default();

    for folder in &bucket.source_folders {
        let source_root = PathBuf::from(folder);
        let walk = WalkJob {
            source_root,
            destination_root: destination_root.clone(),
            recursive: config.recursive,
            ignore: ignore.clone(),
            precomplete_existing: config.precomplete_existing,
        };

        let (entries, skipped) = tokio::task::spawn_blocking(move || walk.run())
            .await
            .map_err(|e| ScanError::Join(e.to_string()))??;

        summary.files_seen += entries.len() as u64;
        summary.skipped += skipped;

        for batch in entries.chunks(SEED_BATCH_SIZE) {
            summary.files_queued += db.insert_many(bucket.id, batch).await?;
        }
    }

    info!(
        bucket = bucket.id,
        seen = summary.files_seen,
        queued = summary.files_queued,
        skipped = summary.skipped,
        "scan finished"
    );
    Ok(summary)
}

struct WalkJob {
    source_root: PathBuf,
    destination_root: PathBuf,
    recursive: bool,
    ignore: IgnoreSet,
    precomplete_existing: bool,
}

impl WalkJob {
    fn run(&self) -> Result<(Vec<NewQueueEntry>, u64)> {
        let root = &self.source_root;
        if !root.exists() {
            return Err(ScanError::SourceMissing(root.clone()));
        }
        if !root.is_dir() {
            return Err(ScanError::NotADirectory(root.clone()));
        }

        let mut walker = walkdir::WalkDir::new(root).follow_links(false);
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        let mut entries = Vec::new();
        let mut skipped = 0u64;

        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(root = %root.display(), error = %err, "skipping unreadable entry");
                    skipped += 1;
                    continue;
                }
            };

            if entry.file_type().is_symlink() {
                skipped += 1;
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let Some(relative) = paths::relative_path(root, entry.path()) else {
                skipped += 1;
                continue;
            };
            if self.ignore.matches(&relative) {
                skipped += 1;
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };

            let destination = self.destination_root.join(&relative);
            let status = if self.precomplete_existing && same_size_destination(&destination, metadata.len()) {
                FileStatus::Completed
            } else {
                FileStatus::Pending
            };

            entries.push(NewQueueEntry {
                source_path: paths::path_str(entry.path()),
                source_folder: paths::path_str(root),
                relative_path: paths::path_str(&relative),
                destination_path: paths::path_str(&destination),
                file_size: metadata.len(),
                status,
            });
        }

        Ok((entries, skipped))
    }
}

fn same_size_destination(destination: &Path, size: u64) -> bool {
    destination
        .metadata()
        .map(|meta| meta.is_file() && meta.len() == size)
        .unwrap_or(false)
}
