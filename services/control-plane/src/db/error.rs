//! Database error types.

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// A row could not be turned into a tenant record.
    #[error("invalid {table} row {id}: {message}")]
    Decode {
        table: &'static str,
        id: String,
        message: String,
    },
}
