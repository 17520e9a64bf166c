//! Program images
//!
//! An image is a 48-byte header followed by a JSON payload holding the
//! serialized [`Module`]:
//!
//! ```text
//! magic "EMBR" (4) | version u32 LE (4) | flags u32 LE (4) | crc32 u32 LE (4) | sha256 (32)
//! ```
//!
//! Both checksums cover the payload only.

use crate::opcode::Opcode;
use crate::types::{
    Function, FunctionId, MethodDef, Signature, TypeDef, TypeId, TypeTag, FieldDef, STRING_TYPE,
    STRING_TYPE_NAME,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

/// Magic number for Ember program images: "EMBR"
pub const MAGIC: [u8; 4] = *b"EMBR";

/// Current image format version
pub const VERSION: u32 = 1;

/// Size of the image header in bytes
pub const HEADER_SIZE: usize = 48;

/// Header flags
pub mod flags {
    /// The module declares an entry point
    pub const HAS_ENTRY: u32 = 1 << 0;
}

/// Image encoding/decoding errors
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Image shorter than its header
    #[error("Image truncated: {0} bytes")]
    Truncated(usize),

    /// Invalid magic number
    #[error("Invalid magic number: expected EMBR, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// CRC32 mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Stored checksum
        expected: u32,
        /// Computed checksum
        actual: u32,
    },

    /// SHA-256 mismatch
    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Stored digest (hex)
        expected: String,
        /// Computed digest (hex)
        actual: String,
    },

    /// Payload could not be parsed
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Module refers to something that does not exist
    #[error("Invalid module: {0}")]
    Invalid(String),

    /// Reading the image failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A compiled program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Module name
    pub name: String,
    /// Type table; index 0 is the builtin `String`
    pub types: Vec<TypeDef>,
    /// Function table
    pub functions: Vec<Function>,
    /// String pool
    pub strings: Vec<String>,
    /// Entry point
    pub entry: Option<FunctionId>,
}

impl Module {
    /// Serialize into an image
    pub fn encode(&self) -> Result<Vec<u8>, ModuleError> {
        let payload = serde_json::to_vec(self)?;
        let crc32 = crc32fast::hash(&payload);
        let digest: [u8; 32] = Sha256::digest(&payload).into();
        let flags = if self.entry.is_some() { flags::HAS_ENTRY } else { 0 };

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&crc32.to_le_bytes());
        out.extend_from_slice(&digest);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse and validate an image
    pub fn decode(data: &[u8]) -> Result<Self, ModuleError> {
        if data.len() < HEADER_SIZE {
            return Err(ModuleError::Truncated(data.len()));
        }

        let magic = [data[0], data[1], data[2], data[3]];
        if magic != MAGIC {
            return Err(ModuleError::InvalidMagic(magic));
        }

        let version = read_u32(data, 4);
        if version != VERSION {
            return Err(ModuleError::UnsupportedVersion(version));
        }

        let stored_crc32 = read_u32(data, 12);
        let stored_digest = &data[16..48];
        let payload = &data[HEADER_SIZE..];

        let crc32 = crc32fast::hash(payload);
        if crc32 != stored_crc32 {
            return Err(ModuleError::ChecksumMismatch {
                expected: stored_crc32,
                actual: crc32,
            });
        }

        let digest = Sha256::digest(payload);
        if digest.as_slice() != stored_digest {
            return Err(ModuleError::HashMismatch {
                expected: hex::encode(stored_digest),
                actual: hex::encode(digest),
            });
        }

        let module: Module = serde_json::from_slice(payload)?;
        module.validate()?;
        Ok(module)
    }

    /// Read and decode an image file
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ModuleError> {
        let data = std::fs::read(path)?;
        Self::decode(&data)
    }

    /// Check every index the module refers to
    pub fn validate(&self) -> Result<(), ModuleError> {
        let invalid = |msg: String| Err(ModuleError::Invalid(msg));

        match self.types.first() {
            Some(t) if t.name == STRING_TYPE_NAME => {}
            _ => return invalid(format!("type {} must be {}", STRING_TYPE, STRING_TYPE_NAME)),
        }

        let type_count = self.types.len();
        let func_count = self.functions.len();
        let string_count = self.strings.len();

        if let Some(entry) = self.entry {
            if entry as usize >= func_count {
                return invalid(format!("entry point {} out of range", entry));
            }
        }

        for def in &self.types {
            if let Some(parent) = def.parent {
                if parent as usize >= type_count {
                    return invalid(format!("{}: parent {} out of range", def.name, parent));
                }
            }
            let bound = def
                .methods
                .iter()
                .map(|m| m.function)
                .chain(def.constructor)
                .chain(def.static_init);
            for func in bound {
                if func as usize >= func_count {
                    return invalid(format!("{}: function {} out of range", def.name, func));
                }
            }
        }

        for func in &self.functions {
            if func.param_slots() > usize::from(func.locals) {
                return invalid(format!("{}: fewer locals than parameters", func.name));
            }
            let code_len = func.code.len();
            for op in &func.code {
                let ok = match *op {
                    Opcode::ConstStr(s) => (s as usize) < string_count,
                    Opcode::CallMethod { name, .. } => (name as usize) < string_count,
                    Opcode::LoadLocal(l) | Opcode::StoreLocal(l) => l < func.locals,
                    Opcode::Jmp(t) | Opcode::JmpIfFalse(t) | Opcode::Try(t) => (t as usize) <= code_len,
                    Opcode::GetStatic { ty, slot } | Opcode::SetStatic { ty, slot } => self
                        .types
                        .get(ty as usize)
                        .map(|t| usize::from(slot) < t.statics.len())
                        .unwrap_or(false),
                    Opcode::New { ty, .. } | Opcode::InstanceOf(ty) => (ty as usize) < type_count,
                    Opcode::Call { func: f, .. } | Opcode::MakeClosure(f) => (f as usize) < func_count,
                    _ => true,
                };
                if !ok {
                    return invalid(format!("{}: bad operand in {:?}", func.name, op));
                }
            }
        }

        Ok(())
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Module`].
///
/// Methods taking a [`TypeId`] that the builder never handed out do not
/// panic; the first such mistake is reported by [`ModuleBuilder::build`].
///
/// ```
/// use ember_core::{ModuleBuilder, Opcode, TypeTag};
///
/// let mut b = ModuleBuilder::new("demo");
/// let game = b.add_type("Game", None);
/// let score = b.add_static(game, "score", TypeTag::Int);
/// b.add_static_method(game, "addPoints", &[TypeTag::Int], TypeTag::Void, 1, vec![
///     Opcode::GetStatic { ty: game, slot: score },
///     Opcode::LoadLocal(0),
///     Opcode::Add,
///     Opcode::SetStatic { ty: game, slot: score },
///     Opcode::ReturnVoid,
/// ]);
/// let module = b.build().unwrap();
/// assert_eq!(module.types[game as usize].name, "Game");
/// ```
#[derive(Debug)]
pub struct ModuleBuilder {
    module: Module,
    error: Option<String>,
}

impl ModuleBuilder {
    /// Start a module; the builtin `String` type is added automatically
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            module: Module {
                name: name.into(),
                types: vec![TypeDef::builtin_string()],
                functions: Vec::new(),
                strings: Vec::new(),
                entry: None,
            },
            error: None,
        }
    }

    /// Add a class
    pub fn add_type(&mut self, name: &str, parent: Option<TypeId>) -> TypeId {
        let mut def = TypeDef::new(name, parent);
        if let Some(parent) = parent.and_then(|p| self.module.types.get(p as usize)) {
            def.fields = parent.fields.clone();
        }
        self.module.types.push(def);
        (self.module.types.len() - 1) as TypeId
    }

    /// Add an instance field; returns its slot
    pub fn add_field(&mut self, ty: TypeId, name: &str, tag: TypeTag) -> u16 {
        let Some(def) = self.type_def(ty, name) else {
            return 0;
        };
        def.fields.push(FieldDef {
            name: name.to_string(),
            ty: tag,
        });
        (def.fields.len() - 1) as u16
    }

    /// Add a static field; returns its slot
    pub fn add_static(&mut self, ty: TypeId, name: &str, tag: TypeTag) -> u16 {
        let Some(def) = self.type_def(ty, name) else {
            return 0;
        };
        def.statics.push(FieldDef {
            name: name.to_string(),
            ty: tag,
        });
        (def.statics.len() - 1) as u16
    }

    /// Intern a string; returns its pool index
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(idx) = self.module.strings.iter().position(|x| x == s) {
            return idx as u32;
        }
        self.module.strings.push(s.to_string());
        (self.module.strings.len() - 1) as u32
    }

    /// Add a free function
    pub fn add_function(
        &mut self,
        name: &str,
        params: &[TypeTag],
        ret: TypeTag,
        locals: u16,
        code: Vec<Opcode>,
    ) -> FunctionId {
        self.push_function(name.to_string(), false, params, ret, locals, code)
    }

    /// Add a static method to a class
    pub fn add_static_method(
        &mut self,
        ty: TypeId,
        name: &str,
        params: &[TypeTag],
        ret: TypeTag,
        locals: u16,
        code: Vec<Opcode>,
    ) -> FunctionId {
        let qualified = format!("{}.{}", self.owner_name(ty, name), name);
        let id = self.push_function(qualified, false, params, ret, locals, code);
        self.bind_method(ty, name, id, true);
        id
    }

    /// Add an instance method; local 0 holds `this`
    pub fn add_method(
        &mut self,
        ty: TypeId,
        name: &str,
        params: &[TypeTag],
        ret: TypeTag,
        locals: u16,
        code: Vec<Opcode>,
    ) -> FunctionId {
        let qualified = format!("{}.{}", self.owner_name(ty, name), name);
        let id = self.push_function(qualified, true, params, ret, locals, code);
        self.bind_method(ty, name, id, false);
        id
    }

    /// Add a constructor; local 0 holds the new instance.
    ///
    /// With `bind` unset the constructor is only reachable through its
    /// symbol name `<Type>.new`.
    pub fn add_constructor(
        &mut self,
        ty: TypeId,
        params: &[TypeTag],
        locals: u16,
        code: Vec<Opcode>,
        bind: bool,
    ) -> FunctionId {
        let qualified = format!("{}.new", self.owner_name(ty, "new"));
        let id = self.push_function(qualified, true, params, TypeTag::Void, locals, code);
        if bind {
            if let Some(def) = self.type_def(ty, "new") {
                def.constructor = Some(id);
            }
        }
        id
    }

    /// Add the static initializer of a class
    pub fn add_static_init(&mut self, ty: TypeId, locals: u16, code: Vec<Opcode>) -> FunctionId {
        let qualified = format!("{}.__init__", self.owner_name(ty, "__init__"));
        let id = self.push_function(qualified, false, &[], TypeTag::Void, locals, code);
        if let Some(def) = self.type_def(ty, "__init__") {
            def.static_init = Some(id);
        }
        id
    }

    /// Set the entry point
    pub fn set_entry(&mut self, func: FunctionId) {
        self.module.entry = Some(func);
    }

    /// Validate and return the module
    pub fn build(self) -> Result<Module, ModuleError> {
        if let Some(error) = self.error {
            return Err(ModuleError::Invalid(error));
        }
        self.module.validate()?;
        Ok(self.module)
    }

    fn push_function(
        &mut self,
        name: String,
        is_method: bool,
        params: &[TypeTag],
        ret: TypeTag,
        locals: u16,
        code: Vec<Opcode>,
    ) -> FunctionId {
        self.module.functions.push(Function {
            name,
            is_method,
            signature: Signature {
                params: params.to_vec(),
                ret,
            },
            locals,
            code,
        });
        (self.module.functions.len() - 1) as FunctionId
    }

    fn bind_method(&mut self, ty: TypeId, name: &str, function: FunctionId, is_static: bool) {
        if let Some(def) = self.type_def(ty, name) {
            def.methods.push(MethodDef {
                name: name.to_string(),
                function,
                is_static,
            });
        }
    }

    /// Type being extended; records an error for an unknown id
    fn type_def(&mut self, ty: TypeId, member: &str) -> Option<&mut TypeDef> {
        if ty as usize >= self.module.types.len() {
            self.error
                .get_or_insert_with(|| format!("member `{}` added to unknown type id {}", member, ty));
            return None;
        }
        self.module.types.get_mut(ty as usize)
    }

    fn owner_name(&mut self, ty: TypeId, member: &str) -> String {
        self.type_def(ty, member).map(|def| def.name.clone()).unwrap_or_default()
    }
}
