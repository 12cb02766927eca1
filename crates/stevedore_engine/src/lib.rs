//! Replication engine: copy workers, per-bucket schedulers, the bucket
//! manager, and the event broadcaster.
//!
//! The engine owns no durable state. Workers return outcomes, schedulers
//! translate outcomes into queue-store transitions, and the manager wires
//! lifecycle commands through to the schedulers.

pub mod cancel;
pub mod copier;
pub mod error;
pub mod events;
pub mod hash;
pub mod manager;
pub mod scheduler;
pub mod translog;

pub use cancel::CancellationToken;
pub use copier::{copy_file, CopyOutcome, CopyRequest};
pub use error::{EngineError, Result};
pub use events::{EventBroadcaster, ProgressCollector, ProgressFlusher};
pub use manager::BucketManager;
pub use scheduler::BucketScheduler;
pub use translog::{TracingTransferLog, TransferLog, TransferRecord};
