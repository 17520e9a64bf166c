//! The embedded runtime
//!
//! A [`Runtime`] owns one guest VM and drives its lifecycle:
//!
//! ```text
//! new -> initialize -> load_* -> run_entry -> calls / update / reload
//! ```
//!
//! Every fallible operation records its outcome: on failure the status and
//! message become available through [`Runtime::last_error`]; on success the
//! record is cleared. Guest exceptions that escape a call are kept in a
//! separate slot until [`Runtime::clear_exception`] or the next call.

use crate::callback::{CallbackFn, CallbackRegistry};
use crate::context::{GuestContext, MemberAccess};
use crate::dispatch::{text_of, Bridge, Callee};
use crate::error::{EmbedError, Result, Status};
use crate::handle::ValueHandle;
use crate::options::{IntegrationMode, ResolveStrategy, RuntimeOptions};
use crate::reload::HotReload;
use crate::resolver::{CachedCall, CachedTarget, MemberCache};
use ember_core::{Module, Signature, TypeTag, Vm, VmStats};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Exception that escaped to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    /// String conversion of the thrown value
    pub message: String,
    /// Unwound frames, innermost first, one per line
    pub stack: String,
}

/// An embedded guest runtime
pub struct Runtime {
    pub(crate) options: RuntimeOptions,
    pub(crate) vm: Option<Vm>,
    pub(crate) mode: IntegrationMode,
    pub(crate) reload: HotReload,
    callbacks: CallbackRegistry,
    memo: MemberCache,
    generation: AtomicU64,
    last_error: Option<(Status, String)>,
    exception: Option<ExceptionInfo>,
}

pub(crate) fn not_initialized() -> EmbedError {
    EmbedError::NotInitialized("runtime not initialized".to_string())
}

impl Runtime {
    /// Create a runtime. Nothing is allocated until [`Runtime::initialize`].
    pub fn new(options: RuntimeOptions) -> Self {
        Self {
            mode: options.mode,
            callbacks: CallbackRegistry::new(options.max_callbacks),
            options,
            vm: None,
            reload: HotReload::default(),
            memo: MemberCache::default(),
            generation: AtomicU64::new(0),
            last_error: None,
            exception: None,
        }
    }

    /// Crate version
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Configuration
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Set up the VM with program arguments
    pub fn initialize(&mut self, args: &[&str]) -> Result<()> {
        let result = if self.vm.is_some() {
            Err(EmbedError::AlreadyInitialized("runtime already initialized".to_string()))
        } else {
            if ember_core::globals::open() {
                log::info!("ember runtime {} initialized", Self::version());
            }
            let mut vm = Vm::new(self.options.vm.clone());
            vm.set_args(args.iter().map(|a| a.to_string()).collect());
            self.vm = Some(vm);
            Ok(())
        };
        self.record(result)
    }

    /// Whether [`Runtime::initialize`] succeeded
    pub fn is_initialized(&self) -> bool {
        self.vm.is_some()
    }

    /// Load a program image from disk
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let result = self.read_image(path).and_then(|data| {
            let module = Module::decode(&data)?;
            self.install(module)?;
            self.reload.remember(path);
            Ok(())
        });
        self.record(result)
    }

    /// Load a program image from memory
    pub fn load_bytes(&mut self, data: &[u8]) -> Result<()> {
        let result = Module::decode(data)
            .map_err(EmbedError::from)
            .and_then(|module| self.install(module));
        self.record(result)
    }

    /// Load an already decoded program
    pub fn load_module(&mut self, module: Module) -> Result<()> {
        let result = self.install(module);
        self.record(result)
    }

    pub(crate) fn read_image(&self, path: &Path) -> Result<Vec<u8>> {
        if !path.exists() {
            return Err(EmbedError::FileNotFound(path.to_path_buf()));
        }
        std::fs::read(path).map_err(|source| EmbedError::Read {
            path: path.to_path_buf(),
            source,
        })
    }

    fn install(&mut self, module: Module) -> Result<()> {
        let hot_reload = self.reload.is_enabled();
        let vm = self.vm.as_mut().ok_or_else(not_initialized)?;
        if vm.is_loaded() {
            return Err(EmbedError::AlreadyInitialized("a program is already loaded".to_string()));
        }
        vm.load(module, hot_reload)?;
        Ok(())
    }

    /// Whether a program is loaded
    pub fn is_loaded(&self) -> bool {
        self.vm.as_ref().map(Vm::is_loaded).unwrap_or(false)
    }

    /// Create type globals, run static initializers and the entry point.
    /// Static member access is legal afterwards.
    pub fn run_entry(&mut self) -> Result<()> {
        self.exception = None;
        let result = match self.vm.as_mut() {
            None => Err(not_initialized()),
            Some(vm) if !vm.is_loaded() => Err(EmbedError::NotInitialized("no program loaded".to_string())),
            Some(vm) => vm.with_native_scope(|vm| vm.run_entry()).map_err(EmbedError::from),
        };
        self.record(result)
    }

    /// Whether the entry point has run
    pub fn entry_executed(&self) -> bool {
        self.vm.as_ref().map(Vm::entry_executed).unwrap_or(false)
    }

    /// Release the runtime. Handles rooted in it stop keeping objects
    /// alive once dropped; handles still held refer to a dead heap.
    pub fn destroy(self) {
        drop(self);
    }

    /// The guest VM, once initialized
    pub fn vm(&self) -> Option<&Vm> {
        self.vm.as_ref()
    }

    /// Heap statistics
    pub fn stats(&self) -> Option<VmStats> {
        self.vm.as_ref().map(Vm::stats)
    }

    /// Run a full collection; returns the number of objects freed
    pub fn collect_garbage(&mut self) -> Result<usize> {
        let result = self.vm.as_mut().map(Vm::collect_garbage).ok_or_else(not_initialized);
        self.record(result)
    }

    /// Root a handle so its object survives collections
    pub fn root(&mut self, handle: &ValueHandle) -> Result<ValueHandle> {
        self.bridged(|b| {
            b.check_handle(handle)?;
            Ok(match handle.heap() {
                Some(heap) => ValueHandle::rooted(handle.raw(), heap),
                None => handle.share(),
            })
        })
    }

    // ========================================================================
    // Errors
    // ========================================================================

    pub(crate) fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(err) => {
                if let EmbedError::Exception { message, stack } = err {
                    self.exception = Some(ExceptionInfo {
                        message: message.clone(),
                        stack: stack.clone(),
                    });
                }
                log::debug!("operation failed: {}", err);
                self.last_error = Some((err.status(), err.to_string()));
            }
        }
        result
    }

    /// Message of the last failed operation
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_ref().map(|(_, msg)| msg.as_str())
    }

    /// Status of the last operation
    pub fn last_status(&self) -> Status {
        self.last_error.as_ref().map(|(status, _)| *status).unwrap_or(Status::Ok)
    }

    /// Exception from the last call, if one escaped
    pub fn exception(&self) -> Option<&ExceptionInfo> {
        self.exception.as_ref()
    }

    /// Message of the pending exception
    pub fn exception_message(&self) -> Option<&str> {
        self.exception.as_ref().map(|e| e.message.as_str())
    }

    /// Stack trace of the pending exception
    pub fn exception_stack(&self) -> Option<&str> {
        self.exception.as_ref().map(|e| e.stack.as_str())
    }

    /// Whether an exception is pending
    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Forget the pending exception
    pub fn clear_exception(&mut self) {
        self.exception = None;
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Current resolution generation; bumped by every successful reload
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Run `op` against the VM with the lookup memo attached and record
    /// the outcome
    fn bridged<T>(&mut self, op: impl FnOnce(&mut Bridge<'_>) -> Result<T>) -> Result<T> {
        let result = match self.vm.as_mut() {
            Some(vm) => {
                self.memo.sync(self.generation.load(Ordering::Acquire));
                let mut bridge = Bridge::new(vm, self.options.strategy, Some(&mut self.memo));
                op(&mut bridge)
            }
            None => Err(not_initialized()),
        };
        self.record(result)
    }

    /// Same as [`Runtime::bridged`] for operations that may run guest code
    fn guest_call<T>(&mut self, op: impl FnOnce(&mut Bridge<'_>) -> Result<T>) -> Result<T> {
        self.exception = None;
        self.bridged(op)
    }

    /// Resolve a static method once for repeated calls
    pub fn cache_static_method(&mut self, type_name: &str, method: &str) -> Result<CachedCall> {
        let generation = self.generation();
        let strategy = self.options.strategy;
        self.bridged(|b| {
            let ty = b.resolve_type(type_name)?;
            b.require_global(ty)?;
            let func = b.static_method(ty, method)?;
            let target = match strategy {
                ResolveStrategy::TypeTable => CachedTarget::Function(func),
                ResolveStrategy::Reflection => CachedTarget::Closure(b.static_closure(ty, method)?),
            };
            Ok(CachedCall::new(type_name, method, b.heap_id(), generation, target))
        })
    }

    /// Call a cached static method. A call cached before the last reload
    /// is re-resolved by name.
    pub fn call_cached(&mut self, call: &CachedCall, args: &[&ValueHandle]) -> Result<ValueHandle> {
        if self.vm.as_ref().is_some_and(|vm| vm.heap_id() != call.heap()) {
            return self.record(Err(EmbedError::TypeMismatch(format!(
                "cached call {}.{} belongs to another runtime",
                call.type_name(),
                call.method()
            ))));
        }
        if call.generation() != self.generation() {
            log::warn!(
                "cached call {}.{} predates generation {}; resolving by name",
                call.type_name(),
                call.method(),
                self.generation()
            );
            return self.call_static(call.type_name(), call.method(), args);
        }
        self.guest_call(|b| match &call.target {
            CachedTarget::Function(func) => b.invoke(Callee::Function { func: *func, this: None }, args),
            CachedTarget::Closure(closure) => b.call_closure(closure, args),
        })
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Register an untyped host callback taking `arity` arguments (0-4)
    pub fn register_callback<F>(&mut self, name: &str, arity: usize, callback: F) -> Result<()>
    where
        F: Fn(&mut GuestContext<'_>, &[ValueHandle]) -> Result<ValueHandle> + Send + Sync + 'static,
    {
        self.register(name, Signature::dynamic(arity), false, Arc::new(callback))
    }

    /// Register a host callback with declared parameter and return types.
    /// Arguments are checked before the callback runs; a `String` return
    /// value is boxed as a `String` object.
    pub fn register_typed_callback<F>(&mut self, name: &str, params: &[TypeTag], ret: TypeTag, callback: F) -> Result<()>
    where
        F: Fn(&mut GuestContext<'_>, &[ValueHandle]) -> Result<ValueHandle> + Send + Sync + 'static,
    {
        let signature = Signature {
            params: params.to_vec(),
            ret,
        };
        self.register(name, signature, true, Arc::new(callback))
    }

    pub(crate) fn register(&mut self, name: &str, signature: Signature, typed: bool, func: Arc<CallbackFn>) -> Result<()> {
        let result = match self.vm.as_mut() {
            Some(vm) => self
                .callbacks
                .register(vm, self.options.strategy, name, signature, typed, func),
            None => Err(not_initialized()),
        };
        self.record(result)
    }

    /// Remove a callback. Guest values still holding its closure keep
    /// working until they are collected.
    pub fn unregister_callback(&mut self, name: &str) -> Result<()> {
        let result = self.callbacks.unregister(name);
        self.record(result)
    }

    /// Guest closure of a registered callback, for passing to guest code
    pub fn callback(&mut self, name: &str) -> Result<ValueHandle> {
        let result = self
            .callbacks
            .closure(name)
            .map(ValueHandle::share)
            .ok_or_else(|| EmbedError::MethodNotFound(format!("callback {} not found", name)));
        self.record(result)
    }

    /// Number of registered callbacks
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }
}

impl MemberAccess for Runtime {
    fn box_string(&mut self, text: &str) -> Result<ValueHandle> {
        self.bridged(|b| b.box_string(text))
    }

    fn as_string(&self, handle: &ValueHandle) -> Option<String> {
        text_of(self.vm.as_ref()?, handle)
    }

    fn get_static_field(&mut self, type_name: &str, field: &str) -> Result<ValueHandle> {
        self.bridged(|b| b.get_static_field(type_name, field))
    }

    fn set_static_field(&mut self, type_name: &str, field: &str, value: &ValueHandle) -> Result<()> {
        self.guest_call(|b| b.set_static_field(type_name, field, value))
    }

    fn call_static(&mut self, type_name: &str, method: &str, args: &[&ValueHandle]) -> Result<ValueHandle> {
        self.guest_call(|b| b.call_static(type_name, method, args))
    }

    fn new_instance(&mut self, type_name: &str, args: &[&ValueHandle]) -> Result<ValueHandle> {
        self.guest_call(|b| b.new_instance(type_name, args))
    }

    fn get_field(&mut self, object: &ValueHandle, field: &str) -> Result<ValueHandle> {
        self.bridged(|b| b.get_field(object, field))
    }

    fn set_field(&mut self, object: &ValueHandle, field: &str, value: &ValueHandle) -> Result<()> {
        self.guest_call(|b| b.set_field(object, field, value))
    }

    fn call_method(&mut self, object: &ValueHandle, method: &str, args: &[&ValueHandle]) -> Result<ValueHandle> {
        self.guest_call(|b| b.call_method(object, method, args))
    }

    fn is_instance_of(&mut self, object: &ValueHandle, type_name: &str) -> bool {
        self.bridged(|b| Ok(b.is_instance_of(object, type_name))).unwrap_or(false)
    }

    fn call_closure(&mut self, closure: &ValueHandle, args: &[&ValueHandle]) -> Result<ValueHandle> {
        self.guest_call(|b| b.call_closure(closure, args))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.vm.is_some() {
            log::debug!("destroying runtime ({} callbacks)", self.callbacks.len());
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("mode", &self.mode)
            .field("strategy", &self.options.strategy)
            .field("loaded", &self.is_loaded())
            .field("entry_executed", &self.entry_executed())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{ModuleBuilder, Opcode};

    fn counter_module() -> Module {
        let mut b = ModuleBuilder::new("counter");
        let ty = b.add_type("Counter", None);
        let count = b.add_static(ty, "count", TypeTag::Int);
        b.add_static_method(
            ty,
            "bump",
            &[],
            TypeTag::Int,
            0,
            vec![
                Opcode::GetStatic { ty, slot: count },
                Opcode::ConstI32(1),
                Opcode::Add,
                Opcode::Dup,
                Opcode::SetStatic { ty, slot: count },
                Opcode::Return,
            ],
        );
        b.build().unwrap()
    }

    #[test]
    fn test_lifecycle_order() {
        let mut rt = Runtime::new(RuntimeOptions::default());
        assert!(matches!(rt.load_module(counter_module()), Err(EmbedError::NotInitialized(_))));
        assert_eq!(rt.last_status(), Status::NotInitialized);

        rt.initialize(&["game"]).unwrap();
        assert_eq!(rt.last_status(), Status::Ok);
        assert!(matches!(rt.initialize(&[]), Err(EmbedError::AlreadyInitialized(_))));
        assert_eq!(rt.vm().map(|vm| vm.args().to_vec()), Some(vec!["game".to_string()]));

        assert!(matches!(rt.run_entry(), Err(EmbedError::NotInitialized(_))));
        rt.load_module(counter_module()).unwrap();
        assert!(matches!(rt.load_module(counter_module()), Err(EmbedError::AlreadyInitialized(_))));
        rt.run_entry().unwrap();
        assert!(rt.entry_executed());
        assert!(matches!(rt.run_entry(), Err(EmbedError::AlreadyInitialized(_))));
    }

    #[test]
    fn test_memo_is_filled_and_reused() {
        let mut rt = Runtime::new(RuntimeOptions::default());
        rt.initialize(&[]).unwrap();
        rt.load_module(counter_module()).unwrap();
        rt.run_entry().unwrap();
        assert_eq!(rt.call_static("Counter", "bump", &[]).unwrap().as_int(0), 1);
        let memoized = rt.memo.len();
        assert!(memoized >= 2);
        assert_eq!(rt.call_static("Counter", "bump", &[]).unwrap().as_int(0), 2);
        assert_eq!(rt.memo.len(), memoized);
    }

    #[test]
    fn test_failure_then_success_clears_error() {
        let mut rt = Runtime::new(RuntimeOptions::default());
        rt.initialize(&[]).unwrap();
        rt.load_module(counter_module()).unwrap();
        rt.run_entry().unwrap();
        assert!(rt.call_static("Counter", "missing", &[]).is_err());
        assert_eq!(rt.last_status(), Status::MethodNotFound);
        assert!(rt.last_error().is_some());
        rt.call_static("Counter", "bump", &[]).unwrap();
        assert_eq!(rt.last_error(), None);
    }
}
