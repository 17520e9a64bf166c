//! Embedding bridge for the Ember runtime
//!
//! This crate lets a native host run a compiled Ember program and talk to it:
//! - Runtime lifecycle: initialize, load an image, run the entry point
//! - Value handles, rooted or ephemeral, over guest values
//! - Member access by name (statics, instances, methods) with cached lookups
//! - Host callbacks the guest calls as ordinary functions
//! - Direct and worker-thread integration modes
//! - Hot reload of function bodies
//! - Type introspection of the loaded program
//! - A C API in [`ffi`]
//!
//! ```no_run
//! use ember_embed::{MemberAccess, Runtime, RuntimeOptions, ValueHandle};
//!
//! # fn main() -> ember_embed::Result<()> {
//! let mut rt = Runtime::new(RuntimeOptions::from_env());
//! rt.initialize(&["game"])?;
//! rt.load_file("game.ebc")?;
//! rt.register_callback("double", 1, |_ctx, args| Ok(ValueHandle::int(args[0].as_int(0) * 2)))?;
//! rt.run_entry()?;
//! rt.call_static("Game", "addPoints", &[&ValueHandle::int(100)])?;
//! let score = rt.get_static_field("Game", "score")?;
//! println!("score = {}", score.as_int(0));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod callback;
mod context;
mod coordinator;
mod dispatch;
mod error;
pub mod ffi;
mod handle;
mod introspect;
mod options;
mod reload;
mod resolver;
mod runtime;

pub use callback::{CallbackFn, MAX_CALLBACK_ARITY};
pub use context::{GuestContext, MemberAccess};
pub use coordinator::{StartFailure, WorkerThread};
pub use error::{EmbedError, Result, Status};
pub use handle::ValueHandle;
pub use introspect::{FieldInfo, MethodInfo, TypeInfo, TypeKind};
pub use options::{
    IntegrationMode, ResolveStrategy, RuntimeOptions, ENV_GC_THRESHOLD, ENV_MAX_CALL_DEPTH, ENV_QUEUE_CAPACITY,
    ENV_RESOLVE,
};
pub use resolver::CachedCall;
pub use runtime::{ExceptionInfo, Runtime};

pub use ember_core;
