//! Error types for the volume key core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
///
/// Each variant maps to a different handling decision for the caller, so
/// failures are never folded into a generic variant.
#[derive(Error, Debug)]
pub enum Error {
    /// Key buffer could not be allocated (or locked memory was required and
    /// unavailable).
    #[error("Cannot allocate volume key: {0}")]
    Allocation(String),

    /// The entropy source failed to deliver the requested quality.
    #[error("Entropy unavailable: {0}")]
    EntropyUnavailable(String),

    /// Non-blocking request against a source that would have stalled.
    #[error("Entropy source would block")]
    WouldBlock,

    /// Device is missing or cannot be opened.
    #[error("Device {path} is not ready: {reason}")]
    DeviceNotReady { path: PathBuf, reason: String },

    /// Requested size or offset does not fit the device.
    #[error("Device {path} is too small: {reason}")]
    SizeMismatch { path: PathBuf, reason: String },

    /// Device is in use by another process or mapping.
    #[error("Cannot use device {path} which is in use ({holder})")]
    DeviceBusy { path: PathBuf, holder: String },

    /// Offset/size cannot be honoured within alignment constraints.
    #[error("Alignment error: {0}")]
    Alignment(String),

    /// A wipe pass failed; erasure is not guaranteed.
    #[error("Wipe failed in pass {pass} after {sectors_written} sectors")]
    WipeFailed {
        pass: usize,
        sectors_written: u64,
        #[source]
        source: Box<Error>,
    },

    /// A wipe was cancelled; erasure is not guaranteed and must be restarted.
    #[error("Wipe cancelled after {sectors_written} sectors")]
    WipeCancelled { sectors_written: u64 },

    /// The confirmation callback declined a destructive operation.
    #[error("Operation not confirmed: {0}")]
    ConfirmationDeclined(String),

    /// Caller passed an argument outside the accepted range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error during block operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::DeviceBusy { .. } | Error::WouldBlock)
    }

    pub(crate) fn not_ready(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::DeviceNotReady {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn too_small(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::SizeMismatch {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn busy(path: impl Into<PathBuf>, holder: impl Into<String>) -> Self {
        Error::DeviceBusy {
            path: path.into(),
            holder: holder.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
