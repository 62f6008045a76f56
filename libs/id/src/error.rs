//! ID validation errors.

use thiserror::Error;

/// Why a raw value or string was rejected as an ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID string is empty")]
    Empty,

    /// Labelled form with the wrong resource label, e.g. `rel_7` for an app.
    #[error("ID label mismatch: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("ID is not an unsigned integer: {0}")]
    InvalidNumber(String),

    /// Zero is reserved for "unset" upstream.
    #[error("{kind} ID cannot be zero")]
    Zero { kind: &'static str },
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
