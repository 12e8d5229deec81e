//! Shared error types.

use thiserror::Error;

/// Errors raised while encoding or decoding shared types.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A value did not have the shape the caller expected.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
