//! Error types for the queue store.

use thiserror::Error;

/// Queue store result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Queue store errors.
///
/// Any store error is fatal to the current operation: the row keeps its
/// prior state and the caller decides whether to retry.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, lock timeout beyond the busy window)
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (filesystem operations around the database)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Row or bucket not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation (unique name, uniqueness triple)
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Invalid state transition or guard failure
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Serialization error (source-folder list, state values)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// Remap a unique-constraint failure into [`DbError::Constraint`].
pub(crate) fn map_unique(err: sqlx::Error, what: &str) -> DbError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.is_unique_violation() {
            return DbError::constraint(format!("{what} already exists"));
        }
    }
    DbError::Sqlx(err)
}
