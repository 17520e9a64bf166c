//! Loaded program
//!
//! A [`Program`] is a validated [`Module`] prepared for execution: function
//! bodies are shared (`Arc`) so running frames survive a patch, and every
//! type, member and function name has its hash precomputed for the
//! type-table scan.

use crate::module::Module;
use crate::types::{hash_name, Function, FunctionId, TypeDef, TypeId};
use crate::{VmError, VmResult};
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
struct MemberHashes {
    fields: Vec<i32>,
    statics: Vec<i32>,
    methods: Vec<i32>,
}

/// Executable program
#[derive(Debug)]
pub struct Program {
    name: String,
    types: Vec<TypeDef>,
    functions: Vec<Arc<Function>>,
    strings: Vec<String>,
    entry: Option<FunctionId>,
    type_hashes: Vec<i32>,
    member_hashes: Vec<MemberHashes>,
    function_hashes: Vec<i32>,
    by_name: FxHashMap<String, TypeId>,
}

impl Program {
    /// Prepare a validated module for execution
    pub fn link(module: Module) -> Self {
        let mut program = Self {
            name: module.name,
            types: module.types,
            functions: module.functions.into_iter().map(Arc::new).collect(),
            strings: module.strings,
            entry: module.entry,
            type_hashes: Vec::new(),
            member_hashes: Vec::new(),
            function_hashes: Vec::new(),
            by_name: FxHashMap::default(),
        };
        program.rehash();
        program
    }

    fn rehash(&mut self) {
        self.type_hashes = self.types.iter().map(|t| hash_name(&t.name)).collect();
        self.member_hashes = self
            .types
            .iter()
            .map(|t| MemberHashes {
                fields: t.fields.iter().map(|f| hash_name(&f.name)).collect(),
                statics: t.statics.iter().map(|f| hash_name(&f.name)).collect(),
                methods: t.methods.iter().map(|m| hash_name(&m.name)).collect(),
            })
            .collect();
        self.function_hashes = self.functions.iter().map(|f| hash_name(&f.name)).collect();
        self.by_name = self
            .types
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i as TypeId))
            .collect();
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type table
    pub fn types(&self) -> &[TypeDef] {
        &self.types
    }

    /// Look up a type definition
    pub fn type_def(&self, ty: TypeId) -> Option<&TypeDef> {
        self.types.get(ty as usize)
    }

    /// Look up a function
    pub fn function(&self, func: FunctionId) -> Option<&Arc<Function>> {
        self.functions.get(func as usize)
    }

    /// Number of functions
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// String pool entry
    pub fn string(&self, idx: u32) -> Option<&str> {
        self.strings.get(idx as usize).map(String::as_str)
    }

    /// Entry point
    pub fn entry(&self) -> Option<FunctionId> {
        self.entry
    }

    /// Type name, `"?"` when out of range
    pub fn type_name(&self, ty: TypeId) -> &str {
        self.type_def(ty).map(|t| t.name.as_str()).unwrap_or("?")
    }

    /// Whether `ty` is `ancestor` or derives from it
    pub fn is_subtype(&self, ty: TypeId, ancestor: TypeId) -> bool {
        let mut current = Some(ty);
        while let Some(t) = current {
            if t == ancestor {
                return true;
            }
            current = self.type_def(t).and_then(|d| d.parent);
        }
        false
    }

    /// Find a method by exact name, walking up the parent chain
    pub fn method_by_name(&self, ty: TypeId, name: &str, is_static: bool) -> Option<FunctionId> {
        let mut current = Some(ty);
        while let Some(t) = current {
            let def = self.type_def(t)?;
            if let Some(m) = def
                .methods
                .iter()
                .find(|m| m.is_static == is_static && m.name == name)
            {
                return Some(m.function);
            }
            if is_static {
                return None;
            }
            current = def.parent;
        }
        None
    }

    // ========================================================================
    // Type-table scan (hash compare, name confirm)
    // ========================================================================

    /// Find a type by scanning the type table
    pub fn scan_type(&self, name: &str) -> Option<TypeId> {
        let h = hash_name(name);
        self.type_hashes
            .iter()
            .enumerate()
            .find(|(i, th)| **th == h && self.types[*i].name == name)
            .map(|(i, _)| i as TypeId)
    }

    /// Find a function by its qualified symbol name
    pub fn scan_function(&self, symbol: &str) -> Option<FunctionId> {
        let h = hash_name(symbol);
        self.function_hashes
            .iter()
            .enumerate()
            .find(|(i, fh)| **fh == h && self.functions[*i].name == symbol)
            .map(|(i, _)| i as FunctionId)
    }

    /// Find a static field slot
    pub fn scan_static(&self, ty: TypeId, name: &str) -> Option<u16> {
        let h = hash_name(name);
        let def = self.type_def(ty)?;
        let hashes = self.member_hashes.get(ty as usize)?;
        hashes
            .statics
            .iter()
            .zip(&def.statics)
            .position(|(sh, f)| *sh == h && f.name == name)
            .map(|i| i as u16)
    }

    /// Find an instance field slot
    pub fn scan_field(&self, ty: TypeId, name: &str) -> Option<u16> {
        let h = hash_name(name);
        let def = self.type_def(ty)?;
        let hashes = self.member_hashes.get(ty as usize)?;
        hashes
            .fields
            .iter()
            .zip(&def.fields)
            .position(|(fh, f)| *fh == h && f.name == name)
            .map(|i| i as u16)
    }

    /// Find a method; instance lookups walk up the parent chain
    pub fn scan_method(&self, ty: TypeId, name: &str, is_static: bool) -> Option<FunctionId> {
        let h = hash_name(name);
        let mut current = Some(ty);
        while let Some(t) = current {
            let def = self.type_def(t)?;
            let hashes = self.member_hashes.get(t as usize)?;
            let found = hashes
                .methods
                .iter()
                .zip(&def.methods)
                .find(|(mh, m)| **mh == h && m.is_static == is_static && m.name == name);
            if let Some((_, m)) = found {
                return Some(m.function);
            }
            if is_static {
                return None;
            }
            current = def.parent;
        }
        None
    }

    // ========================================================================
    // Reflection index
    // ========================================================================

    /// Find a type through the name index
    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    // ========================================================================
    // Patching
    // ========================================================================

    /// Splice the code of `incoming` into this program.
    ///
    /// Types are matched by name and must keep their field layout.
    /// Functions are matched by qualified name: changed bodies are replaced
    /// in place, new functions are appended. Method tables and constructor
    /// bindings are taken from `incoming`. Returns whether any code changed.
    pub fn patch(&mut self, incoming: Module) -> VmResult<bool> {
        let mut type_map = Vec::with_capacity(incoming.types.len());
        for def in &incoming.types {
            let old = self
                .type_by_name(&def.name)
                .ok_or_else(|| VmError::PatchIncompatible(format!("new type {}", def.name)))?;
            if !self.types[old as usize].same_layout(def) {
                return Err(VmError::PatchIncompatible(format!(
                    "field layout of {} changed",
                    def.name
                )));
            }
            type_map.push(old);
        }

        let mut next_new = self.functions.len() as FunctionId;
        let func_map: Vec<FunctionId> = incoming
            .functions
            .iter()
            .map(|f| match self.scan_function(&f.name) {
                Some(old) => old,
                None => {
                    next_new += 1;
                    next_new - 1
                }
            })
            .collect();

        let string_map: Vec<u32> = incoming.strings.iter().map(|s| self.intern(s)).collect();

        let remap_type = |t: TypeId| type_map.get(t as usize).copied().unwrap_or(t);
        let remap_func = |f: FunctionId| func_map.get(f as usize).copied().unwrap_or(f);
        let remap_string = |s: u32| string_map.get(s as usize).copied().unwrap_or(s);

        let mut changed = false;
        for (i, mut func) in incoming.functions.into_iter().enumerate() {
            func.code = func
                .code
                .iter()
                .map(|op| op.remap(remap_type, remap_func, remap_string))
                .collect();
            let target = func_map[i] as usize;
            if target < self.functions.len() {
                if *self.functions[target] != func {
                    log::debug!("patched function {}", func.name);
                    self.functions[target] = Arc::new(func);
                    changed = true;
                }
            } else {
                log::debug!("added function {}", func.name);
                self.functions.push(Arc::new(func));
                changed = true;
            }
        }

        for (i, def) in incoming.types.into_iter().enumerate() {
            let current = &mut self.types[type_map[i] as usize];
            let mut methods = def.methods;
            for m in &mut methods {
                m.function = remap_func(m.function);
            }
            let constructor = def.constructor.map(remap_func);
            let static_init = def.static_init.map(remap_func);
            if current.methods != methods || current.constructor != constructor {
                changed = true;
            }
            current.methods = methods;
            current.constructor = constructor;
            current.static_init = static_init;
        }

        self.rehash();
        Ok(changed)
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(idx) = self.strings.iter().position(|x| x == s) {
            return idx as u32;
        }
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as u32
    }
}
