//! Error types and the closed status taxonomy

use ember_core::{ModuleError, VmError};
use std::ffi::CStr;
use std::path::PathBuf;
use thiserror::Error;

/// Status code reported for every operation
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Success
    Ok = 0,
    /// A required argument was null
    NullArgument = 1,
    /// Runtime, program or type globals not initialized yet
    NotInitialized = 2,
    /// Already initialized, loaded or executed
    AlreadyInitialized = 3,
    /// Program file does not exist
    FileNotFound = 4,
    /// Program file could not be read
    ReadError = 5,
    /// Program image is malformed
    InvalidProgramImage = 6,
    /// Program image has an unsupported format version
    VersionMismatch = 7,
    /// Guest code threw an exception
    ExceptionThrown = 8,
    /// Guest call depth exceeded
    StackOverflow = 9,
    /// Guest heap exhausted
    OutOfMemory = 10,
    /// Type lookup failed
    TypeNotFound = 11,
    /// Field lookup failed
    FieldNotFound = 12,
    /// Method lookup failed
    MethodNotFound = 13,
    /// Wrong number of arguments
    ArgumentCount = 14,
    /// Value of the wrong type
    TypeMismatch = 15,
    /// Access through a null or collected reference
    NullReference = 16,
    /// Worker thread not running
    ThreadNotStarted = 17,
    /// Worker thread already running
    ThreadAlreadyRunning = 18,
    /// Call made from a thread that may not make it
    WrongThread = 19,
    /// Worker message queue full
    QueueFull = 20,
    /// Hot reload was not enabled before loading
    ReloadNotEnabled = 21,
    /// Patch could not be applied
    ReloadFailed = 22,
    /// Capability not available in this configuration
    NotImplemented = 23,
    /// Argument rejected
    InvalidArgument = 24,
    /// Internal error
    Internal = 25,
}

impl Status {
    /// Stable, NUL-terminated description
    pub fn message(self) -> &'static CStr {
        match self {
            Status::Ok => c"ok",
            Status::NullArgument => c"null argument",
            Status::NotInitialized => c"not initialized",
            Status::AlreadyInitialized => c"already initialized",
            Status::FileNotFound => c"file not found",
            Status::ReadError => c"read error",
            Status::InvalidProgramImage => c"invalid program image",
            Status::VersionMismatch => c"version mismatch",
            Status::ExceptionThrown => c"exception thrown",
            Status::StackOverflow => c"stack overflow",
            Status::OutOfMemory => c"out of memory",
            Status::TypeNotFound => c"type not found",
            Status::FieldNotFound => c"field not found",
            Status::MethodNotFound => c"method not found",
            Status::ArgumentCount => c"argument count mismatch",
            Status::TypeMismatch => c"type mismatch",
            Status::NullReference => c"null reference",
            Status::ThreadNotStarted => c"thread not started",
            Status::ThreadAlreadyRunning => c"thread already running",
            Status::WrongThread => c"wrong thread",
            Status::QueueFull => c"message queue full",
            Status::ReloadNotEnabled => c"hot reload not enabled",
            Status::ReloadFailed => c"reload failed",
            Status::NotImplemented => c"not implemented",
            Status::InvalidArgument => c"invalid argument",
            Status::Internal => c"internal error",
        }
    }

    /// Description as a string slice
    pub fn as_str(self) -> &'static str {
        self.message().to_str().unwrap_or("unknown")
    }
}

/// Embedding errors
#[derive(Debug, Error)]
pub enum EmbedError {
    /// A required argument was null
    #[error("null argument: {0}")]
    NullArgument(&'static str),

    /// Something that must happen first has not happened
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// Something that may happen only once already happened
    #[error("already initialized: {0}")]
    AlreadyInitialized(String),

    /// Program file missing
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Program file unreadable
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Malformed program image
    #[error("invalid program image: {0}")]
    InvalidImage(String),

    /// Unsupported image version
    #[error("program image version {found} is not supported (expected {expected})")]
    VersionMismatch {
        /// Version in the image
        found: u32,
        /// Version this build reads
        expected: u32,
    },

    /// Guest exception
    #[error("uncaught exception: {message}")]
    Exception {
        /// String conversion of the thrown value
        message: String,
        /// Unwound frames, innermost first
        stack: String,
    },

    /// Guest call depth exceeded
    #[error("stack overflow")]
    StackOverflow,

    /// Guest heap exhausted
    #[error("out of memory")]
    OutOfMemory,

    /// Type lookup failed
    #[error("type not found: {0}")]
    TypeNotFound(String),

    /// Field lookup failed
    #[error("field not found: {0}")]
    FieldNotFound(String),

    /// Method lookup failed
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Wrong number of arguments
    #[error("{name} expects {expected} arguments, got {got}")]
    ArgumentCount {
        /// Callee
        name: String,
        /// Declared arity
        expected: usize,
        /// Arguments passed
        got: usize,
    },

    /// Value of the wrong type
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Null or collected reference
    #[error("null reference: {0}")]
    NullReference(String),

    /// Worker not running
    #[error("worker thread not running: {0}")]
    ThreadNotRunning(String),

    /// Worker already running
    #[error("worker thread already running")]
    ThreadAlreadyRunning,

    /// Call from a thread that may not make it
    #[error("wrong thread: {0}")]
    WrongThread(String),

    /// Worker queue at capacity
    #[error("message queue full ({0} messages)")]
    QueueFull(usize),

    /// Hot reload not enabled before load
    #[error("hot reload not enabled")]
    ReloadNotEnabled,

    /// Patch rejected
    #[error("reload failed: {0}")]
    ReloadFailed(String),

    /// Capability unavailable
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Argument rejected
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl EmbedError {
    /// Status code for this error
    pub fn status(&self) -> Status {
        match self {
            EmbedError::NullArgument(_) => Status::NullArgument,
            EmbedError::NotInitialized(_) => Status::NotInitialized,
            EmbedError::AlreadyInitialized(_) => Status::AlreadyInitialized,
            EmbedError::FileNotFound(_) => Status::FileNotFound,
            EmbedError::Read { .. } => Status::ReadError,
            EmbedError::InvalidImage(_) => Status::InvalidProgramImage,
            EmbedError::VersionMismatch { .. } => Status::VersionMismatch,
            EmbedError::Exception { .. } => Status::ExceptionThrown,
            EmbedError::StackOverflow => Status::StackOverflow,
            EmbedError::OutOfMemory => Status::OutOfMemory,
            EmbedError::TypeNotFound(_) => Status::TypeNotFound,
            EmbedError::FieldNotFound(_) => Status::FieldNotFound,
            EmbedError::MethodNotFound(_) => Status::MethodNotFound,
            EmbedError::ArgumentCount { .. } => Status::ArgumentCount,
            EmbedError::TypeMismatch(_) => Status::TypeMismatch,
            EmbedError::NullReference(_) => Status::NullReference,
            EmbedError::ThreadNotRunning(_) => Status::ThreadNotStarted,
            EmbedError::ThreadAlreadyRunning => Status::ThreadAlreadyRunning,
            EmbedError::WrongThread(_) => Status::WrongThread,
            EmbedError::QueueFull(_) => Status::QueueFull,
            EmbedError::ReloadNotEnabled => Status::ReloadNotEnabled,
            EmbedError::ReloadFailed(_) => Status::ReloadFailed,
            EmbedError::NotImplemented(_) => Status::NotImplemented,
            EmbedError::InvalidArgument(_) => Status::InvalidArgument,
            EmbedError::Internal(_) => Status::Internal,
        }
    }
}

impl From<VmError> for EmbedError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::StackOverflow => EmbedError::StackOverflow,
            VmError::OutOfMemory => EmbedError::OutOfMemory,
            VmError::NullAccess(msg) => EmbedError::NullReference(msg),
            VmError::TypeError(msg) => EmbedError::TypeMismatch(msg),
            VmError::ArgCount { name, expected, got } => EmbedError::ArgumentCount { name, expected, got },
            VmError::MethodNotFound(name) => EmbedError::MethodNotFound(name),
            VmError::FieldNotFound(name) => EmbedError::FieldNotFound(name),
            VmError::NotInitialized(ty) => EmbedError::NotInitialized(format!(
                "type {} has no global instance; run the entry point first",
                ty
            )),
            VmError::NotLoaded => EmbedError::NotInitialized("no program loaded".to_string()),
            VmError::AlreadyLoaded => EmbedError::AlreadyInitialized("a program is already loaded".to_string()),
            VmError::EntryAlreadyRun => EmbedError::AlreadyInitialized("entry point already executed".to_string()),
            VmError::ReloadNotEnabled => EmbedError::ReloadNotEnabled,
            VmError::PatchIncompatible(msg) => EmbedError::ReloadFailed(msg),
            VmError::Thrown(exc) => EmbedError::Exception {
                stack: exc.stack(),
                message: exc.message,
            },
            VmError::Module(err) => err.into(),
            err @ (VmError::StaleStackTop | VmError::Internal(_)) => EmbedError::Internal(err.to_string()),
        }
    }
}

impl From<ModuleError> for EmbedError {
    fn from(err: ModuleError) -> Self {
        match err {
            ModuleError::UnsupportedVersion(found) => EmbedError::VersionMismatch {
                found,
                expected: ember_core::module::VERSION,
            },
            other => EmbedError::InvalidImage(other.to_string()),
        }
    }
}

/// Result alias for embedding operations
pub type Result<T> = std::result::Result<T, EmbedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_errors_map_to_taxonomy() {
        let cases = [
            (VmError::StackOverflow, Status::StackOverflow),
            (VmError::NullAccess("x".into()), Status::NullReference),
            (VmError::TypeError("x".into()), Status::TypeMismatch),
            (VmError::NotInitialized("Game".into()), Status::NotInitialized),
            (VmError::ReloadNotEnabled, Status::ReloadNotEnabled),
            (VmError::PatchIncompatible("x".into()), Status::ReloadFailed),
            (VmError::StaleStackTop, Status::Internal),
        ];
        for (vm_err, status) in cases {
            assert_eq!(EmbedError::from(vm_err).status(), status);
        }
    }

    #[test]
    fn test_module_version_maps_to_version_mismatch() {
        let err = EmbedError::from(ModuleError::UnsupportedVersion(7));
        assert_eq!(err.status(), Status::VersionMismatch);
        let err = EmbedError::from(ModuleError::Truncated(3));
        assert_eq!(err.status(), Status::InvalidProgramImage);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(Status::Ok.as_str(), "ok");
        assert_eq!(Status::ExceptionThrown.as_str(), "exception thrown");
    }
}
