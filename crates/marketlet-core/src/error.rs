//! Common error types for marketlet.
//!
//! Identifier parsing is the only fallible operation in this crate; the
//! provider surfaces these errors as client errors.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// The input string contains invalid hexadecimal characters.
    #[error("invalid hex encoding")]
    InvalidHex,

    /// The input has an incorrect length.
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// The expected number of bytes.
        expected: usize,
        /// The actual number of bytes.
        got: usize,
    },

    /// The input is not of the form `namespace/name`.
    #[error("invalid pod key: {0:?}")]
    InvalidPodKey(String),

    /// The input is not a valid unsigned integer id.
    #[error("invalid numeric id: {0:?}")]
    InvalidNumber(String),
}
