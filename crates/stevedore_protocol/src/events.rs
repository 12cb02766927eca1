//! Events published to external observers.
//!
//! Delivery is best-effort and at-most-once per subscriber; the queue
//! store remains the ground truth.

use crate::types::{BucketStatus, FileStatus};
use serde::{Deserialize, Serialize};

/// Per-file status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeEvent {
    pub bucket_id: i64,
    pub file_id: i64,
    pub status: FileStatus,
    pub source_path: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Per-file copy progress. Heavily rate-limited; observers receive the
/// latest value per file on each flush tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub bucket_id: i64,
    pub file_id: i64,
    pub bytes_copied: u64,
    pub file_size: u64,
    pub percent: u8,
}

impl ProgressEvent {
    pub fn new(bucket_id: i64, file_id: i64, bytes_copied: u64, file_size: u64) -> Self {
        // Zero-length files are complete the instant they are touched.
        let percent = if file_size == 0 {
            100
        } else {
            ((bytes_copied.saturating_mul(100)) / file_size).min(100) as u8
        };
        Self {
            bucket_id,
            file_id,
            bytes_copied,
            file_size,
            percent,
        }
    }
}

/// Events fanned out by the broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServiceEvent {
    /// A queue entry changed status.
    StatusChange(StatusChangeEvent),

    /// Coalesced copy progress: the latest sample per in-flight file since
    /// the previous flush.
    CopyProgress { updates: Vec<ProgressEvent> },

    /// A bucket's scheduler changed state.
    ServiceChange {
        bucket_id: i64,
        status: BucketStatus,
        worker_count: u32,
        active_workers: u32,
    },

    /// A scan finished seeding the queue for a bucket.
    ScanFinished {
        bucket_id: i64,
        files_seen: u64,
        files_queued: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_for_empty_file_is_full() {
        let event = ProgressEvent::new(1, 1, 0, 0);
        assert_eq!(event.percent, 100);
    }

    #[test]
    fn percent_is_bounded() {
        assert_eq!(ProgressEvent::new(1, 1, 50, 200).percent, 25);
        assert_eq!(ProgressEvent::new(1, 1, 200, 200).percent, 100);
        // bytes beyond the scan-time size still cap at 100
        assert_eq!(ProgressEvent::new(1, 1, 400, 200).percent, 100);
    }
}
