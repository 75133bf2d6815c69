//! Error types for the Tsurugi engine.
//!
//! All failures are represented by the [`TsurugiError`] enum. The engine
//! distinguishes three propagation classes: version conflicts and document
//! failures are captured inside operation results, tragic events escape and
//! fail the engine, and everything else is surfaced to the caller unchanged.

use std::io;

use thiserror::Error;

/// The main error type for engine operations.
#[derive(Error, Debug)]
pub enum TsurugiError {
    /// I/O errors (file operations, fsync, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The operation's version disagrees with the current document version.
    #[error("version conflict: {message} (current version [{current_version}])")]
    VersionConflict {
        message: String,
        current_version: i64,
    },

    /// The segment writer rejected a single document but remains healthy.
    #[error("document failure: {0}")]
    DocumentFailure(String),

    /// Unrecoverable failure of the segment writer or the translog.
    #[error("tragic event: {0}")]
    Tragic(String),

    /// Translog replay failed or the translog is missing/corrupted.
    #[error("recovery failed: {0}")]
    RecoveryFailure(String),

    /// Operation attempted against a closed or failed engine.
    #[error("engine is closed: {0}")]
    AlreadyClosed(String),

    /// Commit of uncommitted segments failed.
    #[error("flush failed: {0}")]
    FlushFailed(String),

    /// Reopening the point-in-time searcher failed.
    #[error("refresh failed: {0}")]
    RefreshFailed(String),

    /// Acquiring an index commit for snapshot/backup failed.
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    /// Translog-level errors
    #[error("translog error: {0}")]
    Translog(String),

    /// Translog file is corrupted beyond the tolerated torn tail.
    #[error("translog corrupted: {0}")]
    TranslogCorrupted(String),

    /// Storage-related errors
    #[error("storage error: {0}")]
    Storage(String),

    /// The on-disk index predates the supported commit metadata format.
    #[error("index format too old: {0}")]
    IndexFormatTooOld(String),

    /// An internal precondition was violated.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with TsurugiError.
pub type Result<T> = std::result::Result<T, TsurugiError>;

impl TsurugiError {
    /// Create a new version conflict error.
    pub fn version_conflict<S: Into<String>>(message: S, current_version: i64) -> Self {
        TsurugiError::VersionConflict {
            message: message.into(),
            current_version,
        }
    }

    /// Create a new document failure.
    pub fn document_failure<S: Into<String>>(msg: S) -> Self {
        TsurugiError::DocumentFailure(msg.into())
    }

    /// Create a new tragic event error.
    pub fn tragic<S: Into<String>>(msg: S) -> Self {
        TsurugiError::Tragic(msg.into())
    }

    /// Create a new recovery failure.
    pub fn recovery<S: Into<String>>(msg: S) -> Self {
        TsurugiError::RecoveryFailure(msg.into())
    }

    /// Create a new already-closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        TsurugiError::AlreadyClosed(msg.into())
    }

    /// Create a new translog error.
    pub fn translog<S: Into<String>>(msg: S) -> Self {
        TsurugiError::Translog(msg.into())
    }

    /// Create a new translog corruption error.
    pub fn translog_corrupted<S: Into<String>>(msg: S) -> Self {
        TsurugiError::TranslogCorrupted(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        TsurugiError::Storage(msg.into())
    }

    /// Create a new illegal state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        TsurugiError::IllegalState(msg.into())
    }

    /// Check whether this error is a version conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, TsurugiError::VersionConflict { .. })
    }

    /// Check whether this error is an already-closed error.
    pub fn is_already_closed(&self) -> bool {
        matches!(self, TsurugiError::AlreadyClosed(_))
    }

    /// Check whether this error is a tragic event.
    pub fn is_tragic(&self) -> bool {
        matches!(self, TsurugiError::Tragic(_))
    }

    /// Check whether this error indicates on-disk corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, TsurugiError::TranslogCorrupted(_))
    }

    /// The current version carried by a version conflict, if any.
    pub fn current_version(&self) -> Option<i64> {
        match self {
            TsurugiError::VersionConflict {
                current_version, ..
            } => Some(*current_version),
            _ => None,
        }
    }
}
