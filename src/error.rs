//! Custom error types for the application.
//!
//! This module defines the error taxonomy used across the capture pipeline.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the failures that can occur while talking to the analyzer and while
//! persisting samples to disk.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceError`**: Structured instrument failure (`kind` + diagnostic
//!   message). Always fatal to the current capture session; the controller
//!   aborts and closes the device before reporting it. Never retried, since
//!   hardware state after a fault is not assumed safe to resume.
//! - **`StorageError`**: Structured output-file failure. Fatal to the
//!   persistence task and cancels acquisition so no further samples are
//!   produced for a writer that cannot persist them.
//! - **`DaqError`**: The top-level enum returned by the controller and the
//!   configuration loader. Wraps the two above plus configuration problems.
//!
//! Recoverable conditions (pull timeouts, ring-buffer overflow) are not part of
//! this hierarchy; they live next to the operation that produces them
//! (`PullError`, `PushError`, `PopError`) and only escalate into a
//! `DeviceError` when the retry policy gives up.

use std::io;
use thiserror::Error;

// =============================================================================
// Device Errors
// =============================================================================

/// Category of an instrument failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// No analyzer is attached.
    NotFound,
    /// The analyzer is attached but owned by another process.
    Busy,
    /// The vendor driver reported an internal fault.
    DriverFault,
    /// A configuration value was rejected by the device.
    InvalidParameter,
    /// The requested capture mode is not supported by this session.
    UnsupportedMode,
    /// The device could not start (or keep) streaming.
    InitiationFailed,
    /// The operation is not allowed in the session's current state.
    InvalidState,
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeviceErrorKind::NotFound => "not_found",
            DeviceErrorKind::Busy => "busy",
            DeviceErrorKind::DriverFault => "driver_fault",
            DeviceErrorKind::InvalidParameter => "invalid_parameter",
            DeviceErrorKind::UnsupportedMode => "unsupported_mode",
            DeviceErrorKind::InitiationFailed => "initiation_failed",
            DeviceErrorKind::InvalidState => "invalid_state",
        };
        write!(f, "{}", label)
    }
}

/// Instrument failure with a category and the driver's diagnostic text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Device {kind} error: {message}")]
pub struct DeviceError {
    /// Failure category.
    pub kind: DeviceErrorKind,
    /// Human-readable cause, usually the vendor error string.
    pub message: String,
}

impl DeviceError {
    /// Create a new device error.
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for an illegal state-machine transition.
    pub fn invalid_state(operation: &str, state: impl std::fmt::Display) -> Self {
        Self::new(
            DeviceErrorKind::InvalidState,
            format!("cannot {operation} while session is {state}"),
        )
    }
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Category of an output-file failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The process may not create or write the file.
    PermissionDenied,
    /// The path does not name a creatable file (missing parent, directory, ...).
    PathInvalid,
    /// The file already exists; outputs are never overwritten.
    AlreadyExists,
    /// The filesystem ran out of space.
    DiskFull,
    /// Any other write failure, including protocol misuse of the writer.
    WriteFailed,
}

impl std::fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StorageErrorKind::PermissionDenied => "permission_denied",
            StorageErrorKind::PathInvalid => "path_invalid",
            StorageErrorKind::AlreadyExists => "already_exists",
            StorageErrorKind::DiskFull => "disk_full",
            StorageErrorKind::WriteFailed => "write_failed",
        };
        write!(f, "{}", label)
    }
}

/// Output-file failure with a category and a diagnostic message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Storage {kind} error: {message}")]
pub struct StorageError {
    /// Failure category.
    pub kind: StorageErrorKind,
    /// Human-readable cause.
    pub message: String,
}

impl StorageError {
    /// Create a new storage error.
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an I/O error. Kinds without a dedicated category map to
    /// `fallback`.
    pub fn from_io(err: &io::Error, fallback: StorageErrorKind, context: &str) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            io::ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            io::ErrorKind::NotFound
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::NotADirectory
            | io::ErrorKind::IsADirectory => StorageErrorKind::PathInvalid,
            io::ErrorKind::StorageFull => StorageErrorKind::DiskFull,
            _ => fallback,
        };
        Self::new(kind, format!("{context}: {err}"))
    }
}

// =============================================================================
// Application Error
// =============================================================================

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the capture application.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration sources could not be parsed or merged.
    ///
    /// **Recovery Strategy**: Abort startup, fix the TOML file or environment.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but failed semantic validation
    /// (e.g. zero span, empty delimiter, zero buffer capacity).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Instrument failure. Fatal to the session.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Output-file failure. Fatal to the persistence task.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A pipeline task panicked or was aborted by the runtime.
    #[error("Pipeline task failed: {0}")]
    TaskFailed(String),
}

impl DaqError {
    /// Device error kind, if this is a device failure.
    pub fn device_kind(&self) -> Option<DeviceErrorKind> {
        match self {
            DaqError::Device(err) => Some(err.kind),
            _ => None,
        }
    }

    /// Storage error kind, if this is a storage failure.
    pub fn storage_kind(&self) -> Option<StorageErrorKind> {
        match self {
            DaqError::Storage(err) => Some(err.kind),
            _ => None,
        }
    }
}
