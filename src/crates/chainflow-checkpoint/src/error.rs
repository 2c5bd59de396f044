//! Error types for checkpoint persistence and codec operations.

use thiserror::Error;

/// Convenience result type using [`CheckpointError`].
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur while encoding, decoding, or persisting checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// JSON serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Tagged-codec failure.
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),

    /// Storage backend failure.
    #[error("checkpoint store error: {0}")]
    Store(String),
}

impl CheckpointError {
    /// Create a store error with a backend-specific message.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }
}
