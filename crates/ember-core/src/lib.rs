//! Ember guest runtime
//!
//! This crate provides the managed runtime that `ember-embed` hosts:
//! - NaN-boxed values and a slot heap with mark-sweep collection
//! - A process-wide root table and the native scan window
//! - Program images (header + checksums + serialized module)
//! - A stack-machine interpreter with exceptions and closures
//! - A reflection API, a cooperative timer queue and a code patcher

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod gc;
pub mod globals;
pub mod module;
pub mod native;
pub mod object;
pub mod opcode;
pub mod program;
pub mod types;
pub mod value;
pub mod vm;

pub use gc::{add_root, GcStats, HeapId, RootGuard, ScopeMark};
pub use module::{Module, ModuleBuilder, ModuleError};
pub use native::NativeFunction;
pub use opcode::Opcode;
pub use program::Program;
pub use types::{hash_name, FunctionId, Signature, TypeId, TypeTag, STRING_TYPE};
pub use value::{Value, ValueKind};
pub use vm::{GuestException, Vm, VmOptions, VmStats};

/// VM execution errors
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Call depth limit exceeded
    #[error("Stack overflow")]
    StackOverflow,

    /// Heap object limit reached
    #[error("Out of memory")]
    OutOfMemory,

    /// Allocation attempted outside a native scope
    #[error("Allocation without a refreshed stack top")]
    StaleStackTop,

    /// Access through a null or collected reference
    #[error("Null access: {0}")]
    NullAccess(String),

    /// Operand or argument of the wrong type
    #[error("Type error: {0}")]
    TypeError(String),

    /// Wrong number of arguments
    #[error("{name} expects {expected} arguments, got {got}")]
    ArgCount {
        /// Callee
        name: String,
        /// Declared arity
        expected: usize,
        /// Arguments passed
        got: usize,
    },

    /// Method lookup failed
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Field lookup failed
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    /// Static access before the type's global instance exists
    #[error("Type {0} has no global instance; the entry point must run first")]
    NotInitialized(String),

    /// No program loaded
    #[error("No program loaded")]
    NotLoaded,

    /// A program is already loaded
    #[error("A program is already loaded")]
    AlreadyLoaded,

    /// The entry point already ran
    #[error("Entry point already executed")]
    EntryAlreadyRun,

    /// Patching requires hot reload to be enabled at load time
    #[error("Hot reload not enabled")]
    ReloadNotEnabled,

    /// Patch does not match the loaded program
    #[error("Incompatible patch: {0}")]
    PatchIncompatible(String),

    /// Uncaught guest exception
    #[error("Uncaught exception: {}", .0.message)]
    Thrown(Box<GuestException>),

    /// Program image error
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Interpreter invariant violated
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VmError {
    /// Whether a guest `Try` handler may catch this error
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            VmError::Thrown(_)
                | VmError::NullAccess(_)
                | VmError::TypeError(_)
                | VmError::ArgCount { .. }
                | VmError::MethodNotFound(_)
                | VmError::FieldNotFound(_)
        )
    }
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
