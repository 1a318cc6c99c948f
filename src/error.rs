//! Error types for raylink

use thiserror::Error;

/// Error codes reported through the native kernel's per-thread error flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeErrorCode {
    InvalidArgument,
    InvalidOperation,
    OutOfMemory,
    UnsupportedHardware,
    Unknown,
}

impl NativeErrorCode {
    /// Converts a raw native error code. Returns `None` for the "no error" code.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            crate::native::ERROR_NONE => None,
            crate::native::ERROR_INVALID_ARGUMENT => Some(Self::InvalidArgument),
            crate::native::ERROR_INVALID_OPERATION => Some(Self::InvalidOperation),
            crate::native::ERROR_OUT_OF_MEMORY => Some(Self::OutOfMemory),
            crate::native::ERROR_UNSUPPORTED_CPU => Some(Self::UnsupportedHardware),
            _ => Some(Self::Unknown),
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Self::InvalidArgument => crate::native::ERROR_INVALID_ARGUMENT,
            Self::InvalidOperation => crate::native::ERROR_INVALID_OPERATION,
            Self::OutOfMemory => crate::native::ERROR_OUT_OF_MEMORY,
            Self::UnsupportedHardware => crate::native::ERROR_UNSUPPORTED_CPU,
            Self::Unknown => crate::native::ERROR_UNKNOWN,
        }
    }
}

impl std::fmt::Display for NativeErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidArgument => "invalid argument",
            Self::InvalidOperation => "invalid operation",
            Self::OutOfMemory => "out of memory",
            Self::UnsupportedHardware => "unsupported hardware",
            Self::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// Coarse classification of [`RayLinkError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Detected locally before any native call: mismatched or unsupported configuration.
    Configuration,
    /// Reported by the native kernel through its error flag.
    NativeKernel,
    /// The caller broke a usage contract (stale buffers, unknown objects, ...).
    Integrity,
    /// The native kernel could not be brought up at all.
    Initialization,
}

#[derive(Error, Debug)]
pub enum RayLinkError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Native kernel error during {operation}: {code}")]
    NativeKernel {
        code: NativeErrorCode,
        operation: &'static str,
    },

    #[error("Incompatible configuration: {0}")]
    IncompatibleConfiguration(String),

    #[error("Traversal width {0} is not enabled for this scene")]
    UnsupportedTraversalWidth(u32),

    #[error("Too many rays for a width-{width} packet: {count}")]
    TooManyRays { width: u32, count: usize },

    #[error("{buffer} buffer length changed (expected {expected}, found {actual})")]
    BufferLengthChanged {
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already added: {0}")]
    AlreadyAdded(String),

    #[error("Invalid mesh: {0}")]
    InvalidMesh(String),

    #[error("Native kernel returned unknown {kind} id {id}")]
    UnknownNativeId { kind: &'static str, id: u32 },

    #[error("Scene must be committed before it can be queried")]
    NotCommitted,

    #[error("Device is still used by {0} other handle(s)")]
    DeviceInUse(usize),
}

impl RayLinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Initialization(_) => ErrorKind::Initialization,
            Self::NativeKernel { .. } => ErrorKind::NativeKernel,
            Self::IncompatibleConfiguration(_)
            | Self::UnsupportedTraversalWidth(_)
            | Self::TooManyRays { .. } => ErrorKind::Configuration,
            Self::BufferLengthChanged { .. }
            | Self::NotFound(_)
            | Self::AlreadyAdded(_)
            | Self::InvalidMesh(_)
            | Self::UnknownNativeId { .. }
            | Self::NotCommitted
            | Self::DeviceInUse(_) => ErrorKind::Integrity,
        }
    }

    /// The native error code, if this error came from the kernel.
    pub fn native_code(&self) -> Option<NativeErrorCode> {
        match self {
            Self::NativeKernel { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RayLinkError>;
