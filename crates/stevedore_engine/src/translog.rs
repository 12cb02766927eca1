//! Normalized transfer log.
//!
//! The scheduler emits one record per outcome through this interface; the
//! default implementation forwards to the structured-logging stack.

use tracing::info;

/// Normalized fields for one transfer-log record.
#[derive(Debug, Clone)]
pub struct TransferRecord<'a> {
    pub bucket_name: &'a str,
    pub source_path: &'a str,
    pub source_folder: &'a str,
    pub file_size: u64,
    pub source_hash: Option<&'a str>,
    pub worker_id: i64,
    pub message: Option<&'a str>,
}

/// Consumed logging interface: per-file records plus service messages.
pub trait TransferLog: Send + Sync {
    fn log(&self, status_label: &str, record: &TransferRecord<'_>);
    fn system(&self, message: &str);
}

/// Tracing-backed transfer log.
pub struct TracingTransferLog;

impl TransferLog for TracingTransferLog {
    fn log(&self, status_label: &str, record: &TransferRecord<'_>) {
        info!(
            target: "stevedore::transfer",
            status = status_label,
            bucket = record.bucket_name,
            source = record.source_path,
            folder = record.source_folder,
            size = record.file_size,
            hash = record.source_hash,
            worker = record.worker_id,
            message = record.message,
            "transfer"
        );
    }

    fn system(&self, message: &str) {
        info!(target: "stevedore::transfer", "{message}");
    }
}
