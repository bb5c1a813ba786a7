use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when interacting with the state store.
///
/// A failed compare-and-swap is not an error: `put_if_version` reports it
/// by returning `false`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store did not answer within its configured bound.
    #[error("Store {operation} for key '{key}' timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        key: String,
        after: Duration,
    },
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
