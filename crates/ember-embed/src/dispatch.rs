//! Call dispatch and member access
//!
//! [`Bridge`] performs every by-name operation against a borrowed VM. The
//! runtime builds one per call with its lookup memo attached; a
//! [`GuestContext`](crate::GuestContext) builds one without.
//!
//! Every operation that can run guest code or allocate does so inside a
//! native scope with its argument values pinned. Host-boxed strings are
//! raw text; wherever the declared type of a parameter or field is
//! `String` they are wrapped into a `String` object first.

use crate::error::{EmbedError, Result};
use crate::handle::ValueHandle;
use crate::options::ResolveStrategy;
use crate::resolver::{self, MemberCache, MemberKey};
use ember_core::{FunctionId, HeapId, Signature, TypeId, TypeTag, Value, Vm, VmError, VmResult};

/// What an invocation calls
#[derive(Debug, Clone, Copy)]
pub(crate) enum Callee<'n> {
    /// Bytecode function, with receiver for instance methods
    Function { func: FunctionId, this: Option<Value> },
    /// Closure value
    Closure(Value),
    /// Static method fetched as a closure through the type's global
    Reflective { ty: TypeId, name: &'n str },
}

pub(crate) struct Bridge<'a> {
    vm: &'a mut Vm,
    strategy: ResolveStrategy,
    memo: Option<&'a mut MemberCache>,
}

impl<'a> Bridge<'a> {
    pub(crate) fn new(vm: &'a mut Vm, strategy: ResolveStrategy, memo: Option<&'a mut MemberCache>) -> Self {
        Self { vm, strategy, memo }
    }

    pub(crate) fn heap_id(&self) -> HeapId {
        self.vm.heap_id()
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    fn memoized(&mut self, key: MemberKey, find: impl FnOnce(&Vm, ResolveStrategy) -> Result<u32>) -> Result<u32> {
        if let Some(hit) = self.memo.as_ref().and_then(|m| m.get(&key)) {
            return Ok(hit);
        }
        let found = find(&*self.vm, self.strategy)?;
        if let Some(memo) = self.memo.as_mut() {
            memo.insert(key, found);
        }
        Ok(found)
    }

    pub(crate) fn resolve_type(&mut self, name: &str) -> Result<TypeId> {
        self.memoized(MemberKey::Type(name.to_string()), |vm, s| resolver::find_type(vm, s, name))
    }

    fn static_slot(&mut self, ty: TypeId, name: &str) -> Result<u16> {
        self.memoized(MemberKey::StaticField(ty, name.to_string()), |vm, s| {
            resolver::find_static_field(vm, s, ty, name).map(u32::from)
        })
        .map(|slot| slot as u16)
    }

    fn field_slot(&mut self, ty: TypeId, name: &str) -> Result<u16> {
        self.memoized(MemberKey::Field(ty, name.to_string()), |vm, s| {
            resolver::find_field(vm, s, ty, name).map(u32::from)
        })
        .map(|slot| slot as u16)
    }

    pub(crate) fn static_method(&mut self, ty: TypeId, name: &str) -> Result<FunctionId> {
        self.memoized(MemberKey::StaticMethod(ty, name.to_string()), |vm, s| {
            resolver::find_method(vm, s, ty, name, true)
        })
    }

    fn method(&mut self, ty: TypeId, name: &str) -> Result<FunctionId> {
        self.memoized(MemberKey::Method(ty, name.to_string()), |vm, s| {
            resolver::find_method(vm, s, ty, name, false)
        })
    }

    /// Type and checked receiver of an instance operation
    fn receiver(&self, object: &ValueHandle) -> Result<(TypeId, Value)> {
        self.check_handle(object)?;
        if object.is_null() {
            return Err(EmbedError::NullReference("object is null".to_string()));
        }
        let value = object.raw();
        let ty = self
            .vm
            .type_of(value)
            .ok_or_else(|| EmbedError::TypeMismatch("value is not an object".to_string()))?;
        Ok((ty, value))
    }

    /// Reject handles from another runtime and handles whose object was
    /// collected
    pub(crate) fn check_handle(&self, handle: &ValueHandle) -> Result<()> {
        if let Some(heap) = handle.heap() {
            if heap != self.vm.heap_id() {
                return Err(EmbedError::TypeMismatch("value belongs to another runtime".to_string()));
            }
            if !self.vm.is_live(handle.raw()) {
                return Err(EmbedError::NullReference("value was collected".to_string()));
            }
        }
        Ok(())
    }

    fn wrap(&self, value: Value) -> ValueHandle {
        ValueHandle::ephemeral(value, self.vm.heap_id())
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    /// Call `callee` with host arguments. The result is ephemeral.
    pub(crate) fn invoke(&mut self, callee: Callee<'_>, args: &[&ValueHandle]) -> Result<ValueHandle> {
        for arg in args {
            self.check_handle(arg)?;
        }
        let raw: Vec<Value> = args.iter().map(|h| h.raw()).collect();
        let result = self.vm.with_native_scope(|vm| -> VmResult<Value> {
            for value in &raw {
                vm.pin(*value);
            }
            match callee {
                Callee::Function { func, this } => {
                    if let Some(receiver) = this {
                        vm.pin(receiver);
                    }
                    let signature = vm.function_signature(func);
                    let args = coerce_args(vm, signature.as_ref(), &raw)?;
                    vm.call_function(func, this, &args)
                }
                Callee::Closure(closure) => {
                    let signature = vm.closure_signature(closure);
                    let args = coerce_args(vm, signature.as_ref(), &raw)?;
                    vm.call_value(closure, &args)
                }
                Callee::Reflective { ty, name } => {
                    let closure = vm.static_method_closure(ty, name)?;
                    vm.pin(closure);
                    let signature = vm.closure_signature(closure);
                    let args = coerce_args(vm, signature.as_ref(), &raw)?;
                    vm.call_value(closure, &args)
                }
            }
        })?;
        Ok(self.wrap(result))
    }

    // ========================================================================
    // Statics
    // ========================================================================

    pub(crate) fn get_static_field(&mut self, type_name: &str, field: &str) -> Result<ValueHandle> {
        let ty = self.resolve_type(type_name)?;
        self.require_global(ty)?;
        let slot = self.static_slot(ty, field)?;
        let value = self.vm.get_static(ty, slot)?;
        Ok(self.wrap(value))
    }

    pub(crate) fn set_static_field(&mut self, type_name: &str, field: &str, value: &ValueHandle) -> Result<()> {
        let ty = self.resolve_type(type_name)?;
        self.require_global(ty)?;
        let slot = self.static_slot(ty, field)?;
        self.check_handle(value)?;
        let tag = self.static_tag(ty, slot);
        let raw = value.raw();
        self.vm.with_native_scope(|vm| {
            let stored = coerce(vm, tag, raw)?;
            vm.set_static(ty, slot, stored)
        })?;
        Ok(())
    }

    pub(crate) fn call_static(&mut self, type_name: &str, method: &str, args: &[&ValueHandle]) -> Result<ValueHandle> {
        let ty = self.resolve_type(type_name)?;
        self.require_global(ty)?;
        let func = self.static_method(ty, method)?;
        let callee = match self.strategy {
            ResolveStrategy::TypeTable => Callee::Function { func, this: None },
            ResolveStrategy::Reflection => Callee::Reflective { ty, name: method },
        };
        self.invoke(callee, args)
    }

    fn static_tag(&self, ty: TypeId, slot: u16) -> TypeTag {
        self.vm
            .program()
            .and_then(|p| p.type_def(ty))
            .and_then(|def| def.statics.get(usize::from(slot)))
            .map(|f| f.ty)
            .unwrap_or(TypeTag::Dynamic)
    }

    fn field_tag(&self, ty: TypeId, slot: u16) -> TypeTag {
        self.vm
            .program()
            .and_then(|p| p.type_def(ty))
            .and_then(|def| def.fields.get(usize::from(slot)))
            .map(|f| f.ty)
            .unwrap_or(TypeTag::Dynamic)
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Construct an instance; the returned handle is rooted
    pub(crate) fn new_instance(&mut self, type_name: &str, args: &[&ValueHandle]) -> Result<ValueHandle> {
        let ty = self.resolve_type(type_name)?;
        for arg in args {
            self.check_handle(arg)?;
        }
        let raw: Vec<Value> = args.iter().map(|h| h.raw()).collect();
        let strategy = self.strategy;
        let ctor = match strategy {
            ResolveStrategy::TypeTable => resolver::find_constructor(self.vm, ty),
            ResolveStrategy::Reflection => self.vm.constructor_of(ty),
        };
        let instance = self.vm.with_native_scope(|vm| -> VmResult<Value> {
            for value in &raw {
                vm.pin(*value);
            }
            let signature = ctor.and_then(|c| vm.function_signature(c));
            let args = coerce_args(vm, signature.as_ref(), &raw)?;
            match strategy {
                ResolveStrategy::Reflection => vm.create_instance(ty, &args),
                ResolveStrategy::TypeTable => {
                    let instance = vm.alloc_instance(ty)?;
                    vm.pin(instance);
                    match ctor {
                        Some(ctor) => {
                            vm.call_function(ctor, Some(instance), &args)?;
                        }
                        None if !args.is_empty() => {
                            return Err(VmError::ArgCount {
                                name: format!("{}.new", type_name),
                                expected: 0,
                                got: args.len(),
                            });
                        }
                        None => {}
                    }
                    Ok(instance)
                }
            }
        })?;
        Ok(ValueHandle::rooted(instance, self.vm.heap_id()))
    }

    pub(crate) fn get_field(&mut self, object: &ValueHandle, field: &str) -> Result<ValueHandle> {
        let (ty, receiver) = self.receiver(object)?;
        let slot = self.field_slot(ty, field)?;
        let value = self.vm.get_field(receiver, slot)?;
        Ok(self.wrap(value))
    }

    pub(crate) fn set_field(&mut self, object: &ValueHandle, field: &str, value: &ValueHandle) -> Result<()> {
        let (ty, receiver) = self.receiver(object)?;
        let slot = self.field_slot(ty, field)?;
        self.check_handle(value)?;
        let tag = self.field_tag(ty, slot);
        let raw = value.raw();
        self.vm.with_native_scope(|vm| {
            vm.pin(receiver);
            let stored = coerce(vm, tag, raw)?;
            vm.set_field(receiver, slot, stored)
        })?;
        Ok(())
    }

    pub(crate) fn call_method(&mut self, object: &ValueHandle, method: &str, args: &[&ValueHandle]) -> Result<ValueHandle> {
        let (ty, receiver) = self.receiver(object)?;
        let func = self.method(ty, method)?;
        self.invoke(Callee::Function { func, this: Some(receiver) }, args)
    }

    pub(crate) fn is_instance_of(&mut self, object: &ValueHandle, type_name: &str) -> bool {
        if object.is_null() || self.check_handle(object).is_err() {
            return false;
        }
        match self.resolve_type(type_name) {
            Ok(ty) => self.vm.is_instance_of(object.raw(), ty),
            Err(_) => false,
        }
    }

    pub(crate) fn call_closure(&mut self, closure: &ValueHandle, args: &[&ValueHandle]) -> Result<ValueHandle> {
        self.check_handle(closure)?;
        self.invoke(Callee::Closure(closure.raw()), args)
    }

    // ========================================================================
    // Strings
    // ========================================================================

    /// Box host text as raw guest text. The handle is ephemeral.
    pub(crate) fn box_string(&mut self, text: &str) -> Result<ValueHandle> {
        let value = self.vm.with_native_scope(|vm| vm.alloc_text(text))?;
        Ok(self.wrap(value))
    }

    /// Static method as a rooted closure, fetched through the type's global
    pub(crate) fn static_closure(&mut self, ty: TypeId, name: &str) -> Result<ValueHandle> {
        let closure = self.vm.with_native_scope(|vm| vm.static_method_closure(ty, name))?;
        Ok(ValueHandle::rooted(closure, self.vm.heap_id()))
    }

    pub(crate) fn require_global(&self, ty: TypeId) -> Result<()> {
        resolver::require_global(self.vm, ty)
    }
}

/// Text of a raw text value or a `String` object owned by `vm`
pub(crate) fn text_of(vm: &Vm, handle: &ValueHandle) -> Option<String> {
    if handle.heap() != Some(vm.heap_id()) || !vm.is_live(handle.raw()) {
        return None;
    }
    vm.text_of(handle.raw())
}

/// Wrap raw text into a `String` object when `tag` asks for one. The
/// result is pinned in the current scope.
pub(crate) fn coerce(vm: &mut Vm, tag: TypeTag, value: Value) -> VmResult<Value> {
    if tag == TypeTag::String && vm.is_raw_text(value) {
        let promoted = vm.promote_text(value)?;
        vm.pin(promoted);
        Ok(promoted)
    } else {
        Ok(value)
    }
}

fn coerce_args(vm: &mut Vm, signature: Option<&Signature>, args: &[Value]) -> VmResult<Vec<Value>> {
    let mut out = args.to_vec();
    if let Some(signature) = signature {
        for (tag, value) in signature.params.iter().zip(out.iter_mut()) {
            *value = coerce(vm, *tag, *value)?;
        }
    }
    Ok(out)
}
