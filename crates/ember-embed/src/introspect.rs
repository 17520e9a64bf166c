//! Type introspection
//!
//! Read-only views of the loaded program's classes: name, parent, the
//! fields and methods a class declares itself, and its static fields.
//! Inherited members are reached by walking [`Runtime::superclass`].
//!
//! A [`TypeInfo`] is a snapshot taken at lookup time; it does not follow
//! later reloads.

use crate::error::{EmbedError, Result};
use crate::resolver;
use crate::runtime::{not_initialized, Runtime};
use ember_core::types::FieldDef;
use ember_core::{Program, TypeId, TypeTag, STRING_TYPE};

/// Kind of a class or of a declared member type
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// No value
    Void = 0,
    /// Any value
    Dynamic = 1,
    /// 32-bit integer
    Int = 2,
    /// 64-bit float
    Float = 3,
    /// 32-bit float
    Single = 4,
    /// Boolean
    Bool = 5,
    /// The builtin `String` class
    String = 6,
    /// Raw text
    Bytes = 7,
    /// Closure
    Function = 8,
    /// Any other class
    Object = 9,
}

impl From<TypeTag> for TypeKind {
    fn from(tag: TypeTag) -> Self {
        match tag {
            TypeTag::Void => TypeKind::Void,
            TypeTag::Dynamic => TypeKind::Dynamic,
            TypeTag::Int => TypeKind::Int,
            TypeTag::Float => TypeKind::Float,
            TypeTag::Single => TypeKind::Single,
            TypeTag::Bool => TypeKind::Bool,
            TypeTag::String | TypeTag::Object(STRING_TYPE) => TypeKind::String,
            TypeTag::Bytes => TypeKind::Bytes,
            TypeTag::Function => TypeKind::Function,
            TypeTag::Object(_) => TypeKind::Object,
        }
    }
}

/// A field declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name
    pub name: String,
    /// Declared type
    pub ty: TypeTag,
    /// Declared type as text: `int`, `String`, or a class name
    pub type_name: String,
}

impl FieldInfo {
    /// Kind of the declared type
    pub fn kind(&self) -> TypeKind {
        self.ty.into()
    }
}

/// A method declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Unqualified name
    pub name: String,
    /// Static methods take no receiver
    pub is_static: bool,
    /// Parameter types, receiver excluded
    pub params: Vec<TypeTag>,
    /// Return type
    pub ret: TypeTag,
}

/// Snapshot of one class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    /// Index in the type table
    pub id: TypeId,
    /// Class name
    pub name: String,
    /// [`TypeKind::String`] for the builtin string class, else [`TypeKind::Object`]
    pub kind: TypeKind,
    /// Parent class name
    pub parent: Option<String>,
    /// Instance fields declared on this class, inherited ones excluded
    pub fields: Vec<FieldInfo>,
    /// Static fields
    pub statics: Vec<FieldInfo>,
    /// Methods declared on this class, static and instance
    pub methods: Vec<MethodInfo>,
}

impl TypeInfo {
    pub(crate) fn describe(program: &Program, id: TypeId) -> Option<Self> {
        let def = program.type_def(id)?;
        let parent = def.parent.and_then(|p| program.type_def(p));
        // Instance fields are laid out inherited-first
        let inherited = parent.map_or(0, |p| p.fields.len()).min(def.fields.len());

        let field = |f: &FieldDef| FieldInfo {
            name: f.name.clone(),
            ty: f.ty,
            type_name: tag_name(program, f.ty),
        };
        let methods = def
            .methods
            .iter()
            .filter_map(|m| {
                let function = program.function(m.function)?;
                Some(MethodInfo {
                    name: m.name.clone(),
                    is_static: m.is_static,
                    params: function.signature.params.clone(),
                    ret: function.signature.ret,
                })
            })
            .collect();

        Some(Self {
            id,
            name: def.name.clone(),
            kind: if id == STRING_TYPE { TypeKind::String } else { TypeKind::Object },
            parent: parent.map(|p| p.name.clone()),
            fields: def.fields[inherited..].iter().map(field).collect(),
            statics: def.statics.iter().map(field).collect(),
            methods,
        })
    }

    /// Declared field by name
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Declared method by name
    pub fn method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }
}

fn tag_name(program: &Program, tag: TypeTag) -> String {
    match tag {
        TypeTag::Void => "void".to_string(),
        TypeTag::Dynamic => "dynamic".to_string(),
        TypeTag::Int => "int".to_string(),
        TypeTag::Float => "float".to_string(),
        TypeTag::Single => "single".to_string(),
        TypeTag::Bool => "bool".to_string(),
        TypeTag::String => program.type_name(STRING_TYPE).to_string(),
        TypeTag::Bytes => "bytes".to_string(),
        TypeTag::Function => "function".to_string(),
        TypeTag::Object(ty) => program.type_name(ty).to_string(),
    }
}

impl Runtime {
    /// Describe a class by name
    pub fn find_type(&mut self, name: &str) -> Result<TypeInfo> {
        let result = self.describe_type(name);
        self.record(result)
    }

    /// Describe every class of the loaded program, in type table order
    pub fn list_types(&mut self) -> Result<Vec<TypeInfo>> {
        let result = self.loaded_program().map(|program| {
            (0..program.types().len() as TypeId)
                .filter_map(|id| TypeInfo::describe(program, id))
                .collect()
        });
        self.record(result)
    }

    /// Parent class of `info`; `None` for a root class
    pub fn superclass(&mut self, info: &TypeInfo) -> Result<Option<TypeInfo>> {
        match &info.parent {
            Some(parent) => self.find_type(parent).map(Some),
            None => Ok(None),
        }
    }

    fn describe_type(&self, name: &str) -> Result<TypeInfo> {
        let vm = self.vm.as_ref().ok_or_else(not_initialized)?;
        let id = resolver::find_type(vm, self.options.strategy, name)?;
        self.loaded_program()
            .and_then(|program| TypeInfo::describe(program, id).ok_or_else(|| EmbedError::TypeNotFound(name.to_string())))
    }

    fn loaded_program(&self) -> Result<&Program> {
        self.vm
            .as_ref()
            .ok_or_else(not_initialized)?
            .program()
            .ok_or_else(|| EmbedError::NotInitialized("no program loaded".to_string()))
    }
}
