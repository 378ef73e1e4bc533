//! Error types for GPIO operations.
//!
//! One enum covers every failure mode of the crate. The variants fall into
//! the classes a caller usually cares about:
//!
//! - validation errors, detected before any kernel call ([`GpioError::is_validation`])
//! - acquisition and registration failures of a line request
//! - plain ioctl / I/O failures on chips and line handles

use nix::errno::Errno;
use thiserror::Error;

/// Result type alias for GPIO operations.
pub type Result<T> = std::result::Result<T, GpioError>;

/// Errors that can occur when working with GPIO chips and lines.
#[derive(Error, Debug)]
pub enum GpioError {
    /// More offsets than a single request can carry
    #[error("Too many lines: {requested} requested, at most {max} per request")]
    TooManyLines { requested: usize, max: usize },

    /// More attribute entries than the kernel accepts
    #[error("Too many attributes: {requested} requested, kernel accepts at most {max}")]
    TooManyAttributes { requested: usize, max: usize },

    /// Attribute descriptor with an unknown discriminant
    #[error("Invalid attribute: {field} = {value} is not a known value")]
    InvalidAttribute { field: &'static str, value: u32 },

    /// Consumer label that does not fit the kernel's name field
    #[error("Invalid consumer label '{label}': {reason}")]
    InvalidLabel { label: String, reason: String },

    /// Line offset beyond the chip's line count
    #[error("Invalid line offset {offset}: chip has {max} lines")]
    InvalidOffset { offset: u32, max: u32 },

    /// Line name not present on the chip
    #[error("Cannot find line with name '{name}'")]
    UnknownLine { name: String },

    /// The kernel rejected the line request; nothing was acquired
    #[error("Line request rejected by the kernel: {source}")]
    AcquisitionFailed {
        #[source]
        source: Errno,
    },

    /// The event delivery channel could not be set up; the handle was closed
    #[error("Failed to register event delivery: {message}")]
    RegistrationFailed { message: String },

    /// The background reader could not be started; the handle was closed
    #[error("Failed to spawn event reader: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// A value write addressed a line that was not requested as output
    #[error("Line '{name}' is not an output")]
    NotAnOutput { name: String },

    /// The event stream has already terminated and the handle is closed
    #[error("Event stream terminated, line handle is closed")]
    StreamTerminated,

    /// A chip device could not be opened
    #[error("Failed to open GPIO chip '{path}': {source}")]
    ChipOpen {
        path: String,
        #[source]
        source: Errno,
    },

    /// An ioctl on a chip or line handle failed
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// A released line did not fall back to input
    #[error("Fallback check failed: {message}")]
    FallbackCheckFailed { message: String },

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),
}

impl GpioError {
    /// Build an [`GpioError::Ioctl`] from a failed nix call.
    pub(crate) fn ioctl(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| Self::Ioctl { op, source }
    }

    /// True for errors raised before any kernel call was made.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::TooManyLines { .. }
                | Self::TooManyAttributes { .. }
                | Self::InvalidAttribute { .. }
                | Self::InvalidLabel { .. }
                | Self::InvalidOffset { .. }
                | Self::UnknownLine { .. }
        )
    }

    /// The errno reported by the kernel, if this error carries one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::AcquisitionFailed { source }
            | Self::ChipOpen { source, .. }
            | Self::Ioctl { source, .. } => Some(*source),
            Self::StdIoError(e) => e.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }

    /// Check if this is a "device not found" type error.
    pub fn is_not_found(&self) -> bool {
        self.errno() == Some(Errno::ENOENT)
    }

    /// Check if this is a permission error.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(Errno::EACCES | Errno::EPERM))
    }

    /// Check if the line or device is busy.
    pub fn is_busy(&self) -> bool {
        self.errno() == Some(Errno::EBUSY)
    }
}
