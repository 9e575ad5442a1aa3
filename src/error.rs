//! Error taxonomy for burst capture.
//!
//! Fatal categories ([`CaptureError::is_fatal`]) abort the whole burst and
//! force the session closed; per-shot categories only drop that shot's
//! outcome and the sequencer moves on.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error type for capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No qualifying hardware, or no raw output configuration.
    #[error("raw capture capability absent: {0}")]
    CapabilityAbsent(String),

    /// Permission denied or the exclusive access gate could not be taken.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Open or configure error, disconnect, or an asynchronous device error.
    #[error("device fault: {0}")]
    DeviceFault(String),

    /// The completion signal for a shot did not arrive in time.
    #[error("shot timed out after {0:?}")]
    ShotTimeout(Duration),

    /// The shot completed with a failure, or its frame never arrived.
    #[error("shot failed: {0}")]
    ShotFailed(String),

    /// Writing an output file failed; the partial file has been removed.
    #[error("failed to persist {path}: {source}")]
    Persistence {
        /// File being written when the failure happened.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The device-info collaborator could not produce a snapshot.
    #[error("device info unavailable: {0}")]
    DeviceInfo(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A persisted outcome does not match what was requested.
    #[error("validation failed: {0}")]
    Validation(String),

    /// I/O error outside of persistence.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Whether this error aborts the whole burst rather than a single shot.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CapabilityAbsent(_) | Self::AccessDenied(_) | Self::DeviceFault(_)
        )
    }
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
