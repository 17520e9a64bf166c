//! By-name member access, shared by the runtime and callback contexts

use crate::dispatch::{text_of, Bridge};
use crate::error::Result;
use crate::handle::ValueHandle;
use crate::options::ResolveStrategy;
use ember_core::Vm;

/// Member access by name.
///
/// Implemented by [`Runtime`](crate::Runtime), which memoizes lookups and
/// records errors, and by [`GuestContext`], the view handed to host
/// callbacks while guest code is running.
pub trait MemberAccess {
    /// Box host text as a guest string. The handle is ephemeral.
    fn box_string(&mut self, text: &str) -> Result<ValueHandle>;

    /// Text of a guest string; `None` for anything else
    fn as_string(&self, handle: &ValueHandle) -> Option<String>;

    /// Read a static field
    fn get_static_field(&mut self, type_name: &str, field: &str) -> Result<ValueHandle>;

    /// Write a static field
    fn set_static_field(&mut self, type_name: &str, field: &str, value: &ValueHandle) -> Result<()>;

    /// Call a static method
    fn call_static(&mut self, type_name: &str, method: &str, args: &[&ValueHandle]) -> Result<ValueHandle>;

    /// Construct an instance. The handle is rooted.
    fn new_instance(&mut self, type_name: &str, args: &[&ValueHandle]) -> Result<ValueHandle>;

    /// Read an instance field
    fn get_field(&mut self, object: &ValueHandle, field: &str) -> Result<ValueHandle>;

    /// Write an instance field
    fn set_field(&mut self, object: &ValueHandle, field: &str, value: &ValueHandle) -> Result<()>;

    /// Call an instance method
    fn call_method(&mut self, object: &ValueHandle, method: &str, args: &[&ValueHandle]) -> Result<ValueHandle>;

    /// Whether `object` is an instance of `type_name` or a subclass
    fn is_instance_of(&mut self, object: &ValueHandle, type_name: &str) -> bool;

    /// Call a closure value
    fn call_closure(&mut self, closure: &ValueHandle, args: &[&ValueHandle]) -> Result<ValueHandle>;
}

/// The runtime as seen from inside a host callback.
///
/// Lookups are not memoized and errors are not recorded; they are
/// returned to the callback only.
pub struct GuestContext<'vm> {
    vm: &'vm mut Vm,
    strategy: ResolveStrategy,
}

impl<'vm> GuestContext<'vm> {
    pub(crate) fn new(vm: &'vm mut Vm, strategy: ResolveStrategy) -> Self {
        Self { vm, strategy }
    }

    /// The guest VM
    pub fn vm(&mut self) -> &mut Vm {
        &mut *self.vm
    }

    fn bridge(&mut self) -> Bridge<'_> {
        Bridge::new(&mut *self.vm, self.strategy, None)
    }

    /// Root `handle` so it outlives the callback
    pub fn root(&mut self, handle: &ValueHandle) -> Result<ValueHandle> {
        self.bridge().check_handle(handle)?;
        Ok(ValueHandle::rooted(handle.raw(), self.vm.heap_id()))
    }
}

impl MemberAccess for GuestContext<'_> {
    fn box_string(&mut self, text: &str) -> Result<ValueHandle> {
        self.bridge().box_string(text)
    }

    fn as_string(&self, handle: &ValueHandle) -> Option<String> {
        text_of(self.vm, handle)
    }

    fn get_static_field(&mut self, type_name: &str, field: &str) -> Result<ValueHandle> {
        self.bridge().get_static_field(type_name, field)
    }

    fn set_static_field(&mut self, type_name: &str, field: &str, value: &ValueHandle) -> Result<()> {
        self.bridge().set_static_field(type_name, field, value)
    }

    fn call_static(&mut self, type_name: &str, method: &str, args: &[&ValueHandle]) -> Result<ValueHandle> {
        self.bridge().call_static(type_name, method, args)
    }

    fn new_instance(&mut self, type_name: &str, args: &[&ValueHandle]) -> Result<ValueHandle> {
        self.bridge().new_instance(type_name, args)
    }

    fn get_field(&mut self, object: &ValueHandle, field: &str) -> Result<ValueHandle> {
        self.bridge().get_field(object, field)
    }

    fn set_field(&mut self, object: &ValueHandle, field: &str, value: &ValueHandle) -> Result<()> {
        self.bridge().set_field(object, field, value)
    }

    fn call_method(&mut self, object: &ValueHandle, method: &str, args: &[&ValueHandle]) -> Result<ValueHandle> {
        self.bridge().call_method(object, method, args)
    }

    fn is_instance_of(&mut self, object: &ValueHandle, type_name: &str) -> bool {
        self.bridge().is_instance_of(object, type_name)
    }

    fn call_closure(&mut self, closure: &ValueHandle, args: &[&ValueHandle]) -> Result<ValueHandle> {
        self.bridge().call_closure(closure, args)
    }
}
