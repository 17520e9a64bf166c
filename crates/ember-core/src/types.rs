//! Type table: classes, fields, methods and function signatures
//!
//! Types are addressed by index ([`TypeId`]). Index 0 is always the
//! builtin `String` class.

use crate::opcode::Opcode;
use serde::{Deserialize, Serialize};

/// Index into the program's type table
pub type TypeId = u32;

/// Index into the program's function table
pub type FunctionId = u32;

/// Builtin `String` class
pub const STRING_TYPE: TypeId = 0;

/// Name of the builtin string class
pub const STRING_TYPE_NAME: &str = "String";

/// Field slot of a `String` object holding its raw text
pub const STRING_TEXT_SLOT: u16 = 0;

/// Field slot of a `String` object holding its length
pub const STRING_LENGTH_SLOT: u16 = 1;

/// Declared type of a parameter, return value or field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    /// No value (returns only)
    Void,
    /// Any value
    Dynamic,
    /// 32-bit integer
    Int,
    /// 64-bit float
    Float,
    /// 32-bit float
    Single,
    /// Boolean
    Bool,
    /// Boxed guest `String` object
    String,
    /// Raw native text storage
    Bytes,
    /// Instance of the given class (or a subclass)
    Object(TypeId),
    /// Closure
    Function,
}

impl TypeTag {
    /// Default value stored in a field of this type before it is assigned
    pub fn default_value(&self) -> crate::Value {
        use crate::Value;
        match self {
            TypeTag::Int => Value::i32(0),
            TypeTag::Float => Value::f64(0.0),
            TypeTag::Single => Value::f32(0.0),
            TypeTag::Bool => Value::bool(false),
            _ => Value::null(),
        }
    }
}

/// Parameter and return types of a callable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Parameter types, receiver excluded
    pub params: Vec<TypeTag>,
    /// Return type
    pub ret: TypeTag,
}

impl Signature {
    /// Untyped signature of the given arity
    pub fn dynamic(arity: usize) -> Self {
        Self {
            params: vec![TypeTag::Dynamic; arity],
            ret: TypeTag::Dynamic,
        }
    }

    /// Number of parameters
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// A field declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Declared type
    pub ty: TypeTag,
}

/// A method binding on a type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Method name (unqualified)
    pub name: String,
    /// Implementing function
    pub function: FunctionId,
    /// Static methods take no receiver
    pub is_static: bool,
}

/// A class in the type table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Fully qualified class name
    pub name: String,
    /// Parent class
    pub parent: Option<TypeId>,
    /// Instance fields, inherited fields first
    pub fields: Vec<FieldDef>,
    /// Static fields, stored on the type's global instance
    pub statics: Vec<FieldDef>,
    /// Instance and static methods declared on this class
    pub methods: Vec<MethodDef>,
    /// Direct constructor binding
    pub constructor: Option<FunctionId>,
    /// Static initializer, run once when globals are created
    pub static_init: Option<FunctionId>,
}

impl TypeDef {
    /// Create an empty class
    pub fn new(name: impl Into<String>, parent: Option<TypeId>) -> Self {
        Self {
            name: name.into(),
            parent,
            fields: Vec::new(),
            statics: Vec::new(),
            methods: Vec::new(),
            constructor: None,
            static_init: None,
        }
    }

    /// The builtin `String` class
    pub fn builtin_string() -> Self {
        let mut def = Self::new(STRING_TYPE_NAME, None);
        def.fields.push(FieldDef {
            name: "bytes".to_string(),
            ty: TypeTag::Bytes,
        });
        def.fields.push(FieldDef {
            name: "length".to_string(),
            ty: TypeTag::Int,
        });
        def
    }

    /// Field and static layout, used to check patch compatibility
    pub fn same_layout(&self, other: &TypeDef) -> bool {
        self.name == other.name && self.fields == other.fields && self.statics == other.statics
    }
}

/// Bytecode function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Qualified name, e.g. `Game.addPoints`
    pub name: String,
    /// Instance methods receive `this` in local 0
    pub is_method: bool,
    /// Parameter and return types
    pub signature: Signature,
    /// Total local slots, receiver and parameters included
    pub locals: u16,
    /// Instructions
    pub code: Vec<Opcode>,
}

impl Function {
    /// Number of declared parameters
    pub fn arity(&self) -> usize {
        self.signature.arity()
    }

    /// Local slots taken by the receiver and parameters
    pub fn param_slots(&self) -> usize {
        self.arity() + usize::from(self.is_method)
    }
}

/// Name hash used by the type table.
///
/// `h = 223 * h + byte` with wrapping 32-bit arithmetic, reduced modulo
/// `0x1FFFFF7B`. Lookups confirm a hash hit by comparing names.
pub fn hash_name(name: &str) -> i32 {
    let mut h: i32 = 0;
    for b in name.bytes() {
        h = h.wrapping_mul(223).wrapping_add(i32::from(b));
    }
    h % 0x1FFF_FF7B
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_name(""), 0);
        assert_eq!(hash_name("a"), 97);
        assert_eq!(hash_name("ab"), 97 * 223 + 98);
        assert_eq!(hash_name("Game"), hash_name("Game"));
        assert_ne!(hash_name("Game"), hash_name("game"));
    }

    #[test]
    fn test_hash_stays_in_range() {
        let long = "x".repeat(512);
        let h = hash_name(&long);
        assert!(h.abs() < 0x1FFF_FF7B);
    }

    #[test]
    fn test_default_values() {
        assert_eq!(TypeTag::Int.default_value().as_i32(), Some(0));
        assert_eq!(TypeTag::Bool.default_value().as_bool(), Some(false));
        assert!(TypeTag::String.default_value().is_null());
    }
}
