//! Canonical default values shared across the service.

/// Default worker cap applied to new buckets.
pub const DEFAULT_WORKER_COUNT: u32 = 4;

/// Hard upper bound on any bucket's worker cap.
pub const DEFAULT_WORKER_MAX_COUNT: u32 = 16;

/// Default queue database filename under the service home.
pub const DEFAULT_DATABASE_FILE: &str = "stevedore.sqlite3";

/// Streamed-copy chunk size (bytes).
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 256 * 1024;

/// Error message recorded when post-copy verification fails.
pub const INTEGRITY_ERROR_MESSAGE: &str =
    "integrity error: destination hash does not match source hash";

/// Error message recorded when a copy is cancelled mid-flight.
pub const CANCELLED_MESSAGE: &str = "copy cancelled";

/// Environment variable overriding the service home directory.
pub const HOME_ENV_VAR: &str = "STEVEDORE_HOME";
