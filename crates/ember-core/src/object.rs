//! Heap object model

use crate::native::NativeFunction;
use crate::types::{FunctionId, TypeId};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Class instance. Also used for the per-type global instances that hold
/// static fields.
#[derive(Debug, Clone)]
pub struct Object {
    /// Class of the instance
    pub ty: TypeId,
    /// Field values in declaration order
    pub fields: Vec<Value>,
}

impl Object {
    /// Create an object with the given field values
    pub fn new(ty: TypeId, fields: Vec<Value>) -> Self {
        Self { ty, fields }
    }

    /// Read a field
    pub fn get(&self, slot: u16) -> Option<Value> {
        self.fields.get(usize::from(slot)).copied()
    }

    /// Write a field; returns false when the slot does not exist
    pub fn set(&mut self, slot: u16, value: Value) -> bool {
        match self.fields.get_mut(usize::from(slot)) {
            Some(field) => {
                *field = value;
                true
            }
            None => false,
        }
    }
}

/// What a closure calls
#[derive(Clone)]
pub enum ClosureTarget {
    /// Bytecode function
    Function(FunctionId),
    /// Host function
    Native(Arc<dyn NativeFunction>),
}

impl fmt::Debug for ClosureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosureTarget::Function(id) => write!(f, "Function({})", id),
            ClosureTarget::Native(native) => write!(f, "Native({})", native.name()),
        }
    }
}

/// Callable value
#[derive(Debug, Clone)]
pub struct Closure {
    /// Call target
    pub target: ClosureTarget,
    /// Receiver bound to the closure
    pub bound: Option<Value>,
}

/// Object stored in a heap slot
#[derive(Debug, Clone)]
pub enum HeapObject {
    /// Raw text storage. Natively constructed strings start out as this.
    Text(String),
    /// Class instance
    Object(Object),
    /// Closure
    Closure(Closure),
}

impl HeapObject {
    /// Push every value this object references
    pub fn trace(&self, out: &mut Vec<Value>) {
        match self {
            HeapObject::Text(_) => {}
            HeapObject::Object(obj) => {
                out.extend(obj.fields.iter().copied().filter(Value::is_ref));
            }
            HeapObject::Closure(closure) => {
                if let Some(bound) = closure.bound {
                    out.push(bound);
                }
            }
        }
    }

    /// Short name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::Text(_) => "text",
            HeapObject::Object(_) => "object",
            HeapObject::Closure(_) => "closure",
        }
    }
}
