//! Reflection API
//!
//! By-name lookups that go through the program's name index and compare
//! member names directly, plus a reflective instance factory. This is the
//! path available to embedders that cannot read the type table.

use super::Vm;
use crate::types::{FunctionId, TypeId};
use crate::value::Value;
use crate::{VmError, VmResult};

impl Vm {
    /// Find a class by name
    pub fn find_type(&self, name: &str) -> Option<TypeId> {
        self.program.as_ref()?.type_by_name(name)
    }

    /// Find an instance field slot by name
    pub fn find_field(&self, ty: TypeId, name: &str) -> Option<u16> {
        let def = self.program.as_ref()?.type_def(ty)?;
        def.fields.iter().position(|f| f.name == name).map(|i| i as u16)
    }

    /// Find a static field slot by name
    pub fn find_static_field(&self, ty: TypeId, name: &str) -> Option<u16> {
        let def = self.program.as_ref()?.type_def(ty)?;
        def.statics.iter().position(|f| f.name == name).map(|i| i as u16)
    }

    /// Find an instance method, including inherited ones
    pub fn find_method(&self, ty: TypeId, name: &str) -> Option<FunctionId> {
        self.program.as_ref()?.method_by_name(ty, name, false)
    }

    /// Find a static method
    pub fn find_static_method(&self, ty: TypeId, name: &str) -> Option<FunctionId> {
        self.program.as_ref()?.method_by_name(ty, name, true)
    }

    /// Fetch a static method as a closure through the type's global.
    ///
    /// Fails with `NotInitialized` before the entry point has run.
    pub fn static_method_closure(&mut self, ty: TypeId, name: &str) -> VmResult<Value> {
        self.global_of(ty)?;
        let func = self.find_static_method(ty, name).ok_or_else(|| {
            let type_name = self
                .program
                .as_ref()
                .map(|p| p.type_name(ty).to_string())
                .unwrap_or_default();
            VmError::MethodNotFound(format!("{}.{}", type_name, name))
        })?;
        self.alloc_closure(func, None)
    }

    /// Constructor of `ty`: the direct binding, else the function named
    /// `<Type>.new`
    pub fn constructor_of(&self, ty: TypeId) -> Option<FunctionId> {
        let program = self.program.as_ref()?;
        let def = program.type_def(ty)?;
        def.constructor.or_else(|| {
            let ctor_name = format!("{}.new", def.name);
            (0..program.function_count() as FunctionId)
                .find(|f| program.function(*f).map(|func| func.name == ctor_name).unwrap_or(false))
        })
    }

    /// Reflective factory: allocate an instance of `ty` and run its
    /// constructor, found through the binding or by its `<Type>.new` name
    pub fn create_instance(&mut self, ty: TypeId, args: &[Value]) -> VmResult<Value> {
        let def = self
            .program_ref()?
            .type_def(ty)
            .ok_or_else(|| VmError::TypeError(format!("unknown type {}", ty)))?;
        let ctor_name = format!("{}.new", def.name);
        let ctor = self.constructor_of(ty);

        for arg in args {
            self.pin(*arg);
        }
        let instance = self.alloc_instance(ty)?;
        match ctor {
            Some(ctor) => {
                self.call_function(ctor, Some(instance), args)?;
            }
            None if !args.is_empty() => {
                return Err(VmError::ArgCount {
                    name: ctor_name,
                    expected: 0,
                    got: args.len(),
                });
            }
            None => {}
        }
        Ok(instance)
    }
}
