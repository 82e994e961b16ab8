//! Error types for the c3dl engine.
//!
//! Three layers mirror the three places a cycle can go wrong:
//! - [`SyncError`]: cycle-level failures (unreadable root, lock held, bad config)
//! - [`FetchError`]: a remote catalog source could not be read this cycle
//! - [`TransferError`]: a single download or local file operation failed

use std::path::PathBuf;
use thiserror::Error;

/// Cycle-level error. Only [`SyncError::Scan`] and [`SyncError::AlreadyRunning`]
/// abort a cycle before any action executes.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Collection root {path} is unreadable: {message}")]
    Scan {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Another instance is already working on {root} ({holder})")]
    AlreadyRunning { root: PathBuf, holder: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl SyncError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether this error stops the whole cycle rather than a single action.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Scan { .. } | SyncError::AlreadyRunning { .. })
    }
}

/// A remote catalog source was unreachable or returned garbage.
///
/// Never fatal: the engine treats the source as "no change this cycle".
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{catalog} unreachable: {message}")]
    Unreachable { catalog: String, message: String },

    #[error("{catalog} returned unparseable data: {message}")]
    Unparseable { catalog: String, message: String },
}

/// Failure of a single transfer or local file operation.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connection reset, timeout, or a retryable HTTP status.
    #[error("Transient failure fetching {url}: {message}")]
    Transient { url: String, message: String },

    /// The finished partial does not have the advertised size.
    #[error("Size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The server refused the range of a resumed request (HTTP 416).
    #[error("Server cannot serve {url} from byte {offset}")]
    RangeNotSatisfiable { url: String, offset: u64 },

    /// The server refused the request with a non-retryable status.
    #[error("Server rejected {url} with HTTP {status}")]
    Rejected { url: String, status: u16 },

    /// Retries exhausted (or a permanent failure); the partial file stays on disk.
    #[error("Transfer of {url} failed after {attempts} attempt(s): {message}")]
    Failed {
        url: String,
        attempts: u32,
        /// Bytes written by the failed attempts.
        fetched: u64,
        message: String,
    },

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn transient(url: &str, message: impl Into<String>) -> Self {
        TransferError::Transient {
            url: url.to_string(),
            message: message.into(),
        }
    }

    /// Check if this error should trigger another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Transient { .. }
                | TransferError::SizeMismatch { .. }
                | TransferError::RangeNotSatisfiable { .. }
        )
    }
}

impl From<crate::cancel::CancelledError> for TransferError {
    fn from(_: crate::cancel::CancelledError) -> Self {
        TransferError::Cancelled
    }
}
