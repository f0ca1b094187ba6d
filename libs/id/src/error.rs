//! Error types for name parsing.

use thiserror::Error;

/// Errors that can occur when parsing a generated name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The name string is empty.
    #[error("name cannot be empty")]
    Empty,

    /// The name is missing the `-` separator.
    #[error("name missing '-' separator")]
    MissingSeparator,

    /// The name has the wrong prefix.
    #[error("invalid name prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion of the name is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl NameError {
    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, NameError::InvalidPrefix { .. })
    }
}
