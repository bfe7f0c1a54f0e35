//! Error types for tenant identifier parsing.

use thiserror::Error;

/// Errors that can occur when parsing tenant identifiers and kinds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("tenant ID cannot be empty")]
    Empty,

    /// The ID is not a valid UUID.
    #[error("invalid tenant ID '{value}': {message}")]
    InvalidUuid { value: String, message: String },

    /// The tenant kind label is unknown.
    #[error("unknown tenant kind '{0}' (expected store, theme or app)")]
    UnknownKind(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
