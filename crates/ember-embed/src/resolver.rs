//! Member resolution
//!
//! Two strategies find types and members by name:
//!
//! - [`ResolveStrategy::TypeTable`] scans the program's type table,
//!   comparing precomputed name hashes and confirming hits by name.
//!   Constructors can be found by their `<Type>.new` symbol.
//! - [`ResolveStrategy::Reflection`] goes through the VM's reflection
//!   API only.
//!
//! Lookups made through a [`Runtime`](crate::Runtime) are memoized per
//! runtime. The memo is tagged with the runtime's resolution generation,
//! which is bumped on every successful reload; a generation change clears
//! it. A [`CachedCall`] carries the generation it was resolved in and
//! re-resolves by name once that generation is gone.

use crate::error::{EmbedError, Result};
use crate::handle::ValueHandle;
use crate::options::ResolveStrategy;
use ember_core::{FunctionId, HeapId, TypeId, Vm};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum MemberKey {
    Type(String),
    StaticField(TypeId, String),
    StaticMethod(TypeId, String),
    Field(TypeId, String),
    Method(TypeId, String),
}

/// Per-runtime lookup memo. Values are type ids, slots or function ids
/// depending on the key.
#[derive(Debug, Default)]
pub(crate) struct MemberCache {
    generation: u64,
    entries: FxHashMap<MemberKey, u32>,
}

impl MemberCache {
    /// Drop every entry if the resolution generation moved on
    pub(crate) fn sync(&mut self, generation: u64) {
        if self.generation != generation {
            if !self.entries.is_empty() {
                log::debug!(
                    "resolution generation {} -> {}: dropping {} memoized lookups",
                    self.generation,
                    generation,
                    self.entries.len()
                );
            }
            self.entries.clear();
            self.generation = generation;
        }
    }

    pub(crate) fn get(&self, key: &MemberKey) -> Option<u32> {
        self.entries.get(key).copied()
    }

    pub(crate) fn insert(&mut self, key: MemberKey, value: u32) {
        self.entries.insert(key, value);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A static method resolved once for repeated calls.
///
/// Obtained from [`Runtime::cache_static_method`](crate::Runtime::cache_static_method).
/// After a reload the call is transparently re-resolved by name. A cached
/// call only runs on the runtime that resolved it.
#[derive(Debug)]
pub struct CachedCall {
    type_name: String,
    method: String,
    heap: HeapId,
    generation: u64,
    pub(crate) target: CachedTarget,
}

#[derive(Debug)]
pub(crate) enum CachedTarget {
    /// Function found in the type table
    Function(FunctionId),
    /// Rooted closure fetched through the reflection API
    Closure(ValueHandle),
}

impl CachedCall {
    pub(crate) fn new(type_name: &str, method: &str, heap: HeapId, generation: u64, target: CachedTarget) -> Self {
        Self {
            type_name: type_name.to_string(),
            method: method.to_string(),
            heap,
            generation,
            target,
        }
    }

    /// Class the method belongs to
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Method name
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Heap of the runtime that resolved the call
    pub fn heap(&self) -> HeapId {
        self.heap
    }

    /// Resolution generation the target was resolved in
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ============================================================================
// Lookups
// ============================================================================

fn type_label(vm: &Vm, ty: TypeId) -> String {
    vm.program().map(|p| p.type_name(ty).to_string()).unwrap_or_default()
}

pub(crate) fn find_type(vm: &Vm, strategy: ResolveStrategy, name: &str) -> Result<TypeId> {
    let program = vm
        .program()
        .ok_or_else(|| EmbedError::NotInitialized("no program loaded".to_string()))?;
    let found = match strategy {
        ResolveStrategy::TypeTable => program.scan_type(name),
        ResolveStrategy::Reflection => vm.find_type(name),
    };
    found.ok_or_else(|| EmbedError::TypeNotFound(name.to_string()))
}

pub(crate) fn find_static_field(vm: &Vm, strategy: ResolveStrategy, ty: TypeId, name: &str) -> Result<u16> {
    let found = match strategy {
        ResolveStrategy::TypeTable => vm.program().and_then(|p| p.scan_static(ty, name)),
        ResolveStrategy::Reflection => vm.find_static_field(ty, name),
    };
    found.ok_or_else(|| EmbedError::FieldNotFound(format!("{}.{}", type_label(vm, ty), name)))
}

pub(crate) fn find_field(vm: &Vm, strategy: ResolveStrategy, ty: TypeId, name: &str) -> Result<u16> {
    let found = match strategy {
        ResolveStrategy::TypeTable => vm.program().and_then(|p| p.scan_field(ty, name)),
        ResolveStrategy::Reflection => vm.find_field(ty, name),
    };
    found.ok_or_else(|| EmbedError::FieldNotFound(format!("{}.{}", type_label(vm, ty), name)))
}

pub(crate) fn find_method(
    vm: &Vm,
    strategy: ResolveStrategy,
    ty: TypeId,
    name: &str,
    is_static: bool,
) -> Result<FunctionId> {
    let found = match (strategy, is_static) {
        (ResolveStrategy::TypeTable, _) => vm.program().and_then(|p| p.scan_method(ty, name, is_static)),
        (ResolveStrategy::Reflection, true) => vm.find_static_method(ty, name),
        (ResolveStrategy::Reflection, false) => vm.find_method(ty, name),
    };
    found.ok_or_else(|| EmbedError::MethodNotFound(format!("{}.{}", type_label(vm, ty), name)))
}

/// Constructor through the type table: the direct binding, else the
/// `<Type>.new` symbol
pub(crate) fn find_constructor(vm: &Vm, ty: TypeId) -> Option<FunctionId> {
    let program = vm.program()?;
    let def = program.type_def(ty)?;
    def.constructor
        .or_else(|| program.scan_function(&format!("{}.new", def.name)))
}

/// Static members live on the type's global instance
pub(crate) fn require_global(vm: &Vm, ty: TypeId) -> Result<()> {
    if vm.global(ty).is_some() {
        Ok(())
    } else {
        Err(EmbedError::NotInitialized(format!(
            "type {} has no global instance; run the entry point first",
            type_label(vm, ty)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{ModuleBuilder, Opcode, TypeTag, VmOptions};

    fn loaded_vm() -> Vm {
        let mut b = ModuleBuilder::new("resolve");
        let base = b.add_type("Base", None);
        b.add_field(base, "id", TypeTag::Int);
        b.add_method(base, "name", &[], TypeTag::Int, 1, vec![Opcode::ConstI32(1), Opcode::Return]);
        let derived = b.add_type("Derived", Some(base));
        b.add_static(derived, "count", TypeTag::Int);
        b.add_constructor(derived, &[], 1, vec![Opcode::ReturnVoid], false);
        let mut vm = Vm::new(VmOptions::default());
        vm.load(b.build().unwrap(), false).unwrap();
        vm
    }

    #[test]
    fn test_strategies_agree() {
        let vm = loaded_vm();
        for strategy in [ResolveStrategy::TypeTable, ResolveStrategy::Reflection] {
            let ty = find_type(&vm, strategy, "Derived").unwrap();
            assert_eq!(find_field(&vm, strategy, ty, "id").unwrap(), 0);
            assert_eq!(find_static_field(&vm, strategy, ty, "count").unwrap(), 0);
            assert!(find_method(&vm, strategy, ty, "name", false).is_ok());
            assert!(matches!(
                find_method(&vm, strategy, ty, "name", true),
                Err(EmbedError::MethodNotFound(_))
            ));
        }
    }

    #[test]
    fn test_missing_type() {
        let vm = loaded_vm();
        assert!(matches!(
            find_type(&vm, ResolveStrategy::TypeTable, "Nope"),
            Err(EmbedError::TypeNotFound(name)) if name == "Nope"
        ));
    }

    #[test]
    fn test_constructor_found_by_symbol() {
        let vm = loaded_vm();
        let ty = find_type(&vm, ResolveStrategy::TypeTable, "Derived").unwrap();
        assert!(find_constructor(&vm, ty).is_some());
        let base = find_type(&vm, ResolveStrategy::TypeTable, "Base").unwrap();
        assert!(find_constructor(&vm, base).is_none());
    }

    #[test]
    fn test_statics_need_globals() {
        let vm = loaded_vm();
        let ty = find_type(&vm, ResolveStrategy::TypeTable, "Derived").unwrap();
        assert!(matches!(require_global(&vm, ty), Err(EmbedError::NotInitialized(_))));
    }

    #[test]
    fn test_cache_clears_on_generation_change() {
        let mut cache = MemberCache::default();
        cache.insert(MemberKey::Type("A".into()), 3);
        cache.sync(0);
        assert_eq!(cache.get(&MemberKey::Type("A".into())), Some(3));
        cache.sync(1);
        assert_eq!(cache.len(), 0);
    }
}
