use crate::config::ConfigValidationError;
use std::io;
use thiserror::Error;

/// Result type for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Errors raised by the archive engine.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Object store network/auth failure.
    #[error("object store {op} failed for '{key}': {message}")]
    Transport {
        op: &'static str,
        key: String,
        message: String,
    },

    /// A segment filename that does not follow `<start>-<durationMs>.<ext>`.
    #[error("malformed segment name '{name}': {reason}")]
    MalformedSegmentName { name: String, reason: String },

    /// MPEG-TS and fragmented MP4 segments in one window.
    #[error("window mixes MPEG-TS and fragmented MP4 segments")]
    UnsupportedMixedFormat,

    /// Box structure failure while remuxing.
    #[error("remux failed on input {input}: {message}")]
    RemuxCorruption { input: usize, message: String },

    #[error("invalid recording locator: {0}")]
    InvalidLocator(String),

    #[error("invalid month '{0}', expected yyyyMM")]
    InvalidMonth(String),

    #[error("invalid time window: {0}")]
    InvalidWindow(String),

    #[error("no recordings in the requested window")]
    NoRecordings,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigValidationError),
}

impl ArchiveError {
    /// Create a transport error from any displayable source.
    pub fn transport(op: &'static str, key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            op,
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Create a malformed-name error.
    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedSegmentName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a remux corruption error for the given input index.
    pub fn remux(input: usize, message: impl Into<String>) -> Self {
        Self::RemuxCorruption {
            input,
            message: message.into(),
        }
    }

    /// Whether the error must abort the surrounding operation.
    ///
    /// Malformed names are skipped item by item; everything else is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::MalformedSegmentName { .. })
    }
}
