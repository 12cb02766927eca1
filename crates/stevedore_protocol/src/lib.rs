//! Shared types for the stevedore replication service.
//!
//! Everything that crosses a crate boundary lives here: queue and bucket
//! records, lifecycle enums, event payloads, configuration, and the
//! destination-mirroring path rules.

pub mod config;
pub mod defaults;
pub mod events;
pub mod paths;
pub mod types;

pub use config::ServiceConfig;
pub use events::{ProgressEvent, ServiceEvent, StatusChangeEvent};
pub use types::{
    Bucket, BucketStatus, BucketUpdate, ConflictAction, FileStatus, FolderActivity,
    HashAlgorithm, NewBucket, NewQueueEntry, QueueEntry, ScopeStats, StatsSnapshot, StatusTotals,
};
