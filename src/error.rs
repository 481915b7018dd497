//! Error taxonomy for DHT operations.
//!
//! Routine network failures (a single contact timing out or refusing a
//! request) are absorbed by the coordinators and never surface here. What
//! reaches the caller is one of: an invariant/format violation, the overall
//! operation timing out, an explicit cancellation, or a transport error the
//! operation had no fallback for.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type DhtResult<T> = std::result::Result<T, DhtError>;

#[derive(Debug, Error)]
pub enum DhtError {
    /// Two identifiers of different bit length were combined.
    #[error("identifier length mismatch: expected {expected} bits, got {actual} bits")]
    LengthMismatch { expected: usize, actual: usize },

    /// A contact violates a routing table invariant.
    #[error("invalid contact: {0}")]
    InvalidContact(String),

    /// Request parameters were rejected before any network I/O happened.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The overall operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The transport failed and the operation had no fallback.
    #[error("network error: {0}")]
    Network(#[from] anyhow::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A spawned operation panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DhtError {
    /// Shorthand for [`DhtError::LengthMismatch`].
    pub(crate) fn length_mismatch(expected: usize, actual: usize) -> Self {
        DhtError::LengthMismatch { expected, actual }
    }

    /// `true` if the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DhtError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DhtError::Timeout(_))
    }
}
