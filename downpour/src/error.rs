//! Error types for the download engine.
//!
//! Every failure surfaced to callers carries a classified [`ErrorKind`] so
//! UI and retry logic can branch on the kind rather than on message text.
//! Raw transport errors never escape the engine.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur inside the download engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Connect, timeout or transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// Server answered with a non-success HTTP status.
    #[error("server returned HTTP {0}")]
    HttpStatus(u16),

    /// Resume validation failed: the remote resource mutated since the
    /// last successfully written byte.
    #[error("resource changed on server since last download")]
    ContentChanged,

    /// The adaptive-media manifest could not be parsed.
    #[error("malformed manifest: {0}")]
    ManifestParse(String),

    /// A redirect landed on a text page pretending to be the resource.
    #[error("redirect to a text page was refused")]
    TextRedirect,

    /// Snapshot or state record read/write failed.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Local file I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The download was cancelled by the user.
    #[error("download cancelled")]
    Cancelled,

    /// Unclassified failure.
    #[error("{0}")]
    Generic(String),
}

impl EngineError {
    /// The classification of this error, suitable for events and retry
    /// decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Network(_) => ErrorKind::Network,
            EngineError::HttpStatus(code) => ErrorKind::HttpStatus(*code),
            EngineError::ContentChanged => ErrorKind::ContentChanged,
            EngineError::ManifestParse(_) => ErrorKind::ManifestParse,
            EngineError::TextRedirect => ErrorKind::TextRedirect,
            EngineError::Persistence(_) => ErrorKind::Persistence,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Generic(_) => ErrorKind::Generic,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

/// Copyable error classification carried on failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    HttpStatus(u16),
    ContentChanged,
    ManifestParse,
    TextRedirect,
    Persistence,
    Io,
    Cancelled,
    Generic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "network error"),
            ErrorKind::HttpStatus(code) => write!(f, "HTTP {}", code),
            ErrorKind::ContentChanged => write!(f, "resource changed on server"),
            ErrorKind::ManifestParse => write!(f, "malformed manifest"),
            ErrorKind::TextRedirect => write!(f, "redirect to text page"),
            ErrorKind::Persistence => write!(f, "persistence failure"),
            ErrorKind::Io => write!(f, "i/o error"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Generic => write!(f, "download failed"),
        }
    }
}

/// Errors raised by the crash-safe store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to write a store file.
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    /// Failed to read a store file.
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
}
