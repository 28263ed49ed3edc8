//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// An instance path does not start with `/`.
    #[error("instance path must start with '/': {0}")]
    NotAbsolute(String),

    /// An instance path segment is empty or contains forbidden characters.
    #[error("invalid instance name '{segment}' in path '{path}'")]
    InvalidSegment { path: String, segment: String },

    /// A channel name does not follow `agent:` / `dm:` conventions.
    #[error("invalid channel name: {0}")]
    InvalidChannel(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error concerns an instance path.
    pub fn is_path_error(&self) -> bool {
        matches!(self, IdError::NotAbsolute(_) | IdError::InvalidSegment { .. })
    }
}
