//! Host callbacks exposed to guest code
//!
//! A registered callback becomes a guest closure whose target is a
//! `Trampoline`. The closure is rooted for as long as the registration
//! lives. The guest calls it like any other function value; the
//! trampoline wraps the arguments in ephemeral handles, hands the callback
//! a [`GuestContext`] and converts the outcome back.
//!
//! A callback that returns an error or panics raises a guest exception
//! carrying the error text, so the panic never crosses back into the
//! interpreter.

use crate::context::GuestContext;
use crate::dispatch::coerce;
use crate::error::{EmbedError, Result};
use crate::handle::ValueHandle;
use crate::options::ResolveStrategy;
use ember_core::{GuestException, NativeFunction, Signature, TypeTag, Value, ValueKind, Vm, VmError, VmResult};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Most parameters a callback may declare
pub const MAX_CALLBACK_ARITY: usize = 4;

/// Host callback body
pub type CallbackFn = dyn Fn(&mut GuestContext<'_>, &[ValueHandle]) -> Result<ValueHandle> + Send + Sync;

struct Trampoline {
    name: String,
    signature: Signature,
    typed: bool,
    strategy: ResolveStrategy,
    func: Arc<CallbackFn>,
}

impl Trampoline {
    fn raise(&self, vm: &mut Vm, message: String) -> VmError {
        match vm.alloc_string(&message) {
            Ok(value) => VmError::Thrown(Box::new(GuestException {
                value,
                message,
                trace: vec![format!("at {}", self.name)],
            })),
            Err(err) => err,
        }
    }

    fn finish(&self, vm: &mut Vm, ret: ValueHandle) -> VmResult<Value> {
        if let Some(heap) = ret.heap() {
            if heap != vm.heap_id() {
                return Err(VmError::TypeError(format!(
                    "callback {} returned a value from another runtime",
                    self.name
                )));
            }
            if !vm.is_live(ret.raw()) {
                return Err(VmError::NullAccess(format!(
                    "callback {} returned a collected value",
                    self.name
                )));
            }
        }
        if !self.typed {
            return Ok(ret.raw());
        }
        match self.signature.ret {
            TypeTag::Void => Ok(Value::null()),
            tag => coerce(vm, tag, ret.raw()),
        }
    }
}

fn accepts(vm: &Vm, tag: TypeTag, value: Value) -> bool {
    match tag {
        TypeTag::Void | TypeTag::Dynamic => true,
        TypeTag::Int => value.kind() == ValueKind::Int,
        TypeTag::Float | TypeTag::Single => value.as_number().is_some(),
        TypeTag::Bool => value.kind() == ValueKind::Bool,
        TypeTag::String => value.is_null() || vm.is_string(value) || vm.is_raw_text(value),
        TypeTag::Bytes => value.is_null() || vm.is_raw_text(value),
        TypeTag::Object(ty) => value.is_null() || vm.is_instance_of(value, ty),
        TypeTag::Function => value.is_null() || vm.is_closure(value),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl NativeFunction for Trampoline {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    fn call(&self, vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
        if self.typed {
            for (i, (tag, value)) in self.signature.params.iter().zip(args).enumerate() {
                if !accepts(vm, *tag, *value) {
                    return Err(VmError::TypeError(format!(
                        "callback {}: argument {} is not {:?}",
                        self.name, i, tag
                    )));
                }
            }
        }

        let heap = vm.heap_id();
        let handles: Vec<ValueHandle> = args.iter().map(|v| ValueHandle::ephemeral(*v, heap)).collect();
        let outcome = {
            let mut ctx = GuestContext::new(vm, self.strategy);
            catch_unwind(AssertUnwindSafe(|| (self.func)(&mut ctx, &handles)))
        };
        drop(handles);

        match outcome {
            Ok(Ok(ret)) => self.finish(vm, ret),
            Ok(Err(err)) => {
                log::debug!("callback {} failed: {}", self.name, err);
                Err(self.raise(vm, err.to_string()))
            }
            Err(payload) => {
                let message = format!("callback {} panicked: {}", self.name, panic_message(payload.as_ref()));
                log::error!("{}", message);
                Err(self.raise(vm, message))
            }
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug)]
struct Registration {
    closure: ValueHandle,
}

/// Named callbacks of one runtime
#[derive(Debug)]
pub(crate) struct CallbackRegistry {
    capacity: usize,
    entries: FxHashMap<String, Registration>,
}

impl CallbackRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: FxHashMap::default(),
        }
    }

    pub(crate) fn register(
        &mut self,
        vm: &mut Vm,
        strategy: ResolveStrategy,
        name: &str,
        signature: Signature,
        typed: bool,
        func: Arc<CallbackFn>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(EmbedError::InvalidArgument("callback name is empty".to_string()));
        }
        if signature.arity() > MAX_CALLBACK_ARITY {
            return Err(EmbedError::InvalidArgument(format!(
                "callback {} takes {} arguments; at most {} are supported",
                name,
                signature.arity(),
                MAX_CALLBACK_ARITY
            )));
        }
        if self.entries.contains_key(name) {
            return Err(EmbedError::InvalidArgument(format!("callback {} already registered", name)));
        }
        if self.entries.len() >= self.capacity {
            return Err(EmbedError::InvalidArgument(format!(
                "maximum number of callbacks reached ({})",
                self.capacity
            )));
        }

        let arity = signature.arity();
        let trampoline = Arc::new(Trampoline {
            name: name.to_string(),
            signature,
            typed,
            strategy,
            func,
        });
        let closure = vm.with_native_scope(|vm| vm.alloc_native_closure(trampoline))?;
        let closure = ValueHandle::rooted(closure, vm.heap_id());
        log::debug!("registered callback {} ({} arguments)", name, arity);
        self.entries.insert(name.to_string(), Registration { closure });
        Ok(())
    }

    pub(crate) fn unregister(&mut self, name: &str) -> Result<()> {
        match self.entries.remove(name) {
            Some(_) => {
                log::debug!("unregistered callback {}", name);
                Ok(())
            }
            None => Err(EmbedError::MethodNotFound(format!("callback {} not found", name))),
        }
    }

    pub(crate) fn closure(&self, name: &str) -> Option<&ValueHandle> {
        self.entries.get(name).map(|r| &r.closure)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::VmOptions;

    fn echo() -> Arc<CallbackFn> {
        Arc::new(|_ctx: &mut GuestContext<'_>, args: &[ValueHandle]| {
            Ok(ValueHandle::int(args.first().map(|a| a.as_int(0)).unwrap_or(0)))
        })
    }

    #[test]
    fn test_register_limits() {
        let mut vm = Vm::new(VmOptions::default());
        let mut reg = CallbackRegistry::new(2);
        let s = ResolveStrategy::TypeTable;

        reg.register(&mut vm, s, "a", Signature::dynamic(1), false, echo()).unwrap();
        assert!(matches!(
            reg.register(&mut vm, s, "a", Signature::dynamic(1), false, echo()),
            Err(EmbedError::InvalidArgument(_))
        ));
        assert!(matches!(
            reg.register(&mut vm, s, "wide", Signature::dynamic(5), false, echo()),
            Err(EmbedError::InvalidArgument(_))
        ));
        reg.register(&mut vm, s, "b", Signature::dynamic(0), false, echo()).unwrap();
        assert!(matches!(
            reg.register(&mut vm, s, "c", Signature::dynamic(0), false, echo()),
            Err(EmbedError::InvalidArgument(msg)) if msg.contains("maximum")
        ));
        assert_eq!(reg.len(), 2);
        assert_eq!(vm.stats().roots, 2);
    }

    #[test]
    fn test_unregister_releases_root() {
        let mut vm = Vm::new(VmOptions::default());
        let mut reg = CallbackRegistry::new(4);
        reg.register(&mut vm, ResolveStrategy::TypeTable, "a", Signature::dynamic(1), false, echo())
            .unwrap();
        assert!(reg.closure("a").is_some());
        reg.unregister("a").unwrap();
        assert_eq!(vm.stats().roots, 0);
        assert!(matches!(reg.unregister("a"), Err(EmbedError::MethodNotFound(_))));
    }

    #[test]
    fn test_closure_invokes_callback() {
        let mut vm = Vm::new(VmOptions::default());
        let mut reg = CallbackRegistry::new(4);
        reg.register(&mut vm, ResolveStrategy::TypeTable, "echo", Signature::dynamic(1), false, echo())
            .unwrap();
        let closure = reg.closure("echo").unwrap().raw();
        let result = vm
            .with_native_scope(|vm| vm.call_value(closure, &[Value::i32(9)]))
            .unwrap();
        assert_eq!(result.as_i32(), Some(9));
    }

    #[test]
    fn test_panic_becomes_guest_exception() {
        let mut vm = Vm::new(VmOptions::default());
        let mut reg = CallbackRegistry::new(4);
        let boom: Arc<CallbackFn> = Arc::new(|_ctx: &mut GuestContext<'_>, _args: &[ValueHandle]| -> Result<ValueHandle> {
            panic!("boom")
        });
        reg.register(&mut vm, ResolveStrategy::TypeTable, "boom", Signature::dynamic(0), false, boom)
            .unwrap();
        let closure = reg.closure("boom").unwrap().raw();
        let err = vm.with_native_scope(|vm| vm.call_value(closure, &[])).unwrap_err();
        match err {
            VmError::Thrown(exc) => assert!(exc.message.contains("boom")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_typed_callback_checks_arguments() {
        let mut vm = Vm::new(VmOptions::default());
        let mut reg = CallbackRegistry::new(4);
        let signature = Signature {
            params: vec![TypeTag::Int],
            ret: TypeTag::Int,
        };
        reg.register(&mut vm, ResolveStrategy::TypeTable, "int", signature, true, echo())
            .unwrap();
        let closure = reg.closure("int").unwrap().raw();
        let err = vm
            .with_native_scope(|vm| vm.call_value(closure, &[Value::bool(true)]))
            .unwrap_err();
        assert!(matches!(err, VmError::TypeError(_)));
    }
}
