//! Error types for hookvfs

use std::time::Duration;
use thiserror::Error;

/// Result type alias using our error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for hookvfs operations
#[derive(Error, Debug)]
pub enum Error {
    /// The segment-scoped allocator could not satisfy a request
    #[error("shared segment exhausted: {0}")]
    SegmentExhausted(String),

    /// Attach against an instance whose segment does not exist
    #[error("shared segment not found: {0}")]
    SegmentNotFound(String),

    /// A second hook context was attached within the same process
    #[error("hook context already attached in this process")]
    DuplicateAttach,

    /// A real path recorded in the tree is absent on disk
    #[error("real backing missing for {0}")]
    BackingMissing(String),

    /// Cross-process mutex wait exceeded its bound
    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(Duration),

    /// Path canonicalization failed
    #[error("invalid path: {0}")]
    PathInvalid(String),

    /// A write-class operation ran before an overlay root was configured
    #[error("no writable overlay root configured")]
    OverlayUnconfigured,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error indicates the entry simply does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::SegmentNotFound(_) | Error::BackingMissing(_))
    }
}
