//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`] which wraps the underlying
//! [`sqlx`] errors with additional context about which operation failed.

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The addressed record does not exist.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A conditional write lost: the stored status was not the expected one.
    #[error("Conflict: stored status is {actual}")]
    Conflict {
        /// The status actually stored.
        actual: String,
    },

    /// A stored row could not be mapped back to a record.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// The store refused the write (outage or simulated outage).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
