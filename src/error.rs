//! Unified error types for the write path
//!
//! Append-path errors surface to the caller immediately; flush-path errors
//! are absorbed by the tree and retried. Nothing in the engine unwinds
//! through a flush; every fallible call returns an explicit result.

use crate::wal::entry::WalError;

/// Main error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum SiltError {
    /// Append deadline exceeded while the buffer was at capacity.
    /// Nothing was mutated; the caller may retry.
    #[error("buffer full: append deadline exceeded")]
    BufferFull,

    /// Epoch monotonicity broken or another internal invariant failed.
    /// Fatal; the caller is expected to halt the engine.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The segment encoder or manifest commit failed during a flush.
    /// Buffer and map are untouched; the flush is retried.
    #[error("flush failed: {0}")]
    FlushFailed(String),

    /// Write-ahead log errors
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Vector dimension mismatch against the collection dimension
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Invalid input data (empty id, too many tags, ...)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors (manifest, segment row tables)
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, SiltError>;

impl SiltError {
    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a flush failure error
    pub fn flush_failed(msg: impl Into<String>) -> Self {
        Self::FlushFailed(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}
