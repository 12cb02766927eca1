//! Engine error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced to the control plane by the manager and schedulers.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("bucket {0} not found")]
    BucketNotFound(i64),

    #[error("invalid operation: {0}")]
    Invalid(String),

    #[error(transparent)]
    Db(#[from] stevedore_db::DbError),
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}
