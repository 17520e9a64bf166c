//! The virtual machine
//!
//! A [`Vm`] owns one heap, at most one loaded [`Program`], the per-type
//! global instances that hold static fields, the interpreter frames and
//! the cooperative event queue.
//!
//! Allocation is only legal inside a native scope (see
//! [`Vm::enter_native_scope`]); every embedder entry point that may
//! allocate opens one first.

mod events;
mod interpreter;
mod reflect;

pub use events::EventQueue;
pub use interpreter::GuestException;

use crate::gc::{GcStats, Heap, HeapId, ScopeMark};
use crate::module::Module;
use crate::native::NativeFunction;
use crate::object::{Closure, ClosureTarget, HeapObject, Object};
use crate::program::Program;
use crate::types::{FunctionId, Signature, TypeId, STRING_TYPE};
use crate::value::{Value, ValueKind};
use crate::{VmError, VmResult};
use interpreter::Frame;
use std::sync::Arc;

/// VM configuration
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Live objects that trigger the first collection
    pub gc_threshold: usize,

    /// Hard limit on live objects (None = unlimited)
    pub max_objects: Option<usize>,

    /// Maximum nested guest frames before a stack overflow is raised
    pub max_call_depth: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            gc_threshold: 1024,
            max_objects: None,
            max_call_depth: 512,
        }
    }
}

/// Heap and execution statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Live heap objects
    pub live_objects: usize,
    /// Explicit roots registered for this heap
    pub roots: usize,
    /// Collector statistics
    pub gc: GcStats,
    /// Pending timers
    pub pending_events: usize,
}

/// Guest virtual machine
pub struct Vm {
    options: VmOptions,
    heap: Heap,
    program: Option<Program>,
    globals: Vec<Option<Value>>,
    frames: Vec<Frame>,
    events: EventQueue,
    hot_reload: bool,
    entry_executed: bool,
    args: Vec<String>,
}

impl Vm {
    /// Create an empty VM
    pub fn new(options: VmOptions) -> Self {
        let heap = Heap::new(options.gc_threshold, options.max_objects);
        Self {
            options,
            heap,
            program: None,
            globals: Vec::new(),
            frames: Vec::new(),
            events: EventQueue::default(),
            hot_reload: false,
            entry_executed: false,
            args: Vec::new(),
        }
    }

    /// Configuration
    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Identity of this VM's heap
    pub fn heap_id(&self) -> HeapId {
        self.heap.id()
    }

    /// Program arguments
    pub fn set_args(&mut self, args: Vec<String>) {
        self.args = args;
    }

    /// Program arguments
    pub fn args(&self) -> &[String] {
        &self.args
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Load a program. With `hot_reload` set the program can later be
    /// patched with [`Vm::patch`].
    pub fn load(&mut self, module: Module, hot_reload: bool) -> VmResult<()> {
        if self.program.is_some() {
            return Err(VmError::AlreadyLoaded);
        }
        module.validate()?;
        log::info!(
            "loading module {} ({} types, {} functions)",
            module.name,
            module.types.len(),
            module.functions.len()
        );
        self.program = Some(Program::link(module));
        self.hot_reload = hot_reload;
        Ok(())
    }

    /// Whether a program is loaded
    pub fn is_loaded(&self) -> bool {
        self.program.is_some()
    }

    /// The loaded program
    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    fn program_ref(&self) -> VmResult<&Program> {
        self.program.as_ref().ok_or(VmError::NotLoaded)
    }

    /// Whether the entry point has run
    pub fn entry_executed(&self) -> bool {
        self.entry_executed
    }

    /// Create the per-type global instances, run static initializers in
    /// type order, then run the entry point.
    pub fn run_entry(&mut self) -> VmResult<()> {
        if self.entry_executed {
            return Err(VmError::EntryAlreadyRun);
        }
        let program = self.program_ref()?;
        let entry = program.entry();
        let layouts: Vec<Vec<Value>> = program
            .types()
            .iter()
            .map(|t| t.statics.iter().map(|f| f.ty.default_value()).collect())
            .collect();
        let inits: Vec<FunctionId> = program.types().iter().filter_map(|t| t.static_init).collect();

        self.globals = vec![None; layouts.len()];
        for (ty, fields) in layouts.into_iter().enumerate() {
            let global = self.alloc(HeapObject::Object(Object::new(ty as TypeId, fields)))?;
            self.globals[ty] = Some(global);
        }
        self.entry_executed = true;

        for init in inits {
            self.call_function(init, None, &[])?;
        }
        if let Some(entry) = entry {
            self.call_function(entry, None, &[])?;
        }
        Ok(())
    }

    /// Replace function bodies with those of `module`; static state is kept
    /// and static initializers are not re-run. Returns whether any code
    /// changed.
    pub fn patch(&mut self, module: Module) -> VmResult<bool> {
        if !self.hot_reload {
            return Err(VmError::ReloadNotEnabled);
        }
        module.validate()?;
        let program = self.program.as_mut().ok_or(VmError::NotLoaded)?;
        let changed = program.patch(module)?;
        log::info!("patched module {} (changed: {})", program.name(), changed);
        Ok(changed)
    }

    // ========================================================================
    // Native scopes and allocation
    // ========================================================================

    /// Refresh the collector's stack top. Allocation is legal until the
    /// mark is handed back to [`Vm::leave_native_scope`].
    pub fn enter_native_scope(&mut self) -> ScopeMark {
        self.heap.refresh_stack_top()
    }

    /// Close a native scope opened by [`Vm::enter_native_scope`]
    pub fn leave_native_scope(&mut self, mark: ScopeMark) {
        self.heap.restore_stack_top(mark);
    }

    /// Run `f` inside a native scope
    pub fn with_native_scope<R>(&mut self, f: impl FnOnce(&mut Vm) -> R) -> R {
        let mark = self.enter_native_scope();
        let result = f(self);
        self.leave_native_scope(mark);
        result
    }

    /// Keep `value` alive until the current native scope closes
    pub fn pin(&mut self, value: Value) {
        self.heap.pin(value);
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    fn alloc(&mut self, object: HeapObject) -> VmResult<Value> {
        if !self.heap.stack_top_is_fresh() {
            return Err(VmError::StaleStackTop);
        }
        self.maybe_collect();
        self.heap.insert(object).map(Value::from_ref)
    }

    /// Run a full collection
    pub fn collect_garbage(&mut self) -> usize {
        let mut roots: Vec<Value> = self.globals.iter().flatten().copied().collect();
        for frame in &self.frames {
            frame.trace(&mut roots);
        }
        roots.extend(self.events.roots());
        self.heap.collect(roots)
    }

    /// Heap statistics
    pub fn stats(&self) -> VmStats {
        VmStats {
            live_objects: self.heap.live_objects(),
            roots: crate::gc::roots::count_for(self.heap.id()),
            gc: self.heap.stats(),
            pending_events: self.events.len(),
        }
    }

    /// Whether `value` is not a reference, or references a live object
    pub fn is_live(&self, value: Value) -> bool {
        !value.is_ref() || self.heap.deref(value).is_some()
    }

    // ========================================================================
    // Strings
    // ========================================================================

    /// Allocate raw text storage, the representation natively constructed
    /// strings start out with
    pub fn alloc_text(&mut self, text: &str) -> VmResult<Value> {
        self.alloc(HeapObject::Text(text.to_string()))
    }

    /// Allocate a guest `String` object
    pub fn alloc_string(&mut self, text: &str) -> VmResult<Value> {
        if !self.heap.stack_top_is_fresh() {
            return Err(VmError::StaleStackTop);
        }
        // Both objects are inserted without a collection in between
        self.maybe_collect();
        let length = i32::try_from(text.chars().count()).unwrap_or(i32::MAX);
        let raw = self.heap.insert(HeapObject::Text(text.to_string()))?;
        let object = Object::new(STRING_TYPE, vec![Value::from_ref(raw), Value::i32(length)]);
        self.heap.insert(HeapObject::Object(object)).map(Value::from_ref)
    }

    /// Whether `value` is raw text storage
    pub fn is_raw_text(&self, value: Value) -> bool {
        matches!(self.heap.deref(value), Some(HeapObject::Text(_)))
    }

    /// Whether `value` is a guest `String` object
    pub fn is_string(&self, value: Value) -> bool {
        matches!(self.heap.deref(value), Some(HeapObject::Object(o)) if o.ty == STRING_TYPE)
    }

    /// Wrap raw text into a guest `String` object. Other values are
    /// returned unchanged.
    pub fn promote_text(&mut self, value: Value) -> VmResult<Value> {
        let length = match self.heap.deref(value) {
            Some(HeapObject::Text(s)) => i32::try_from(s.chars().count()).unwrap_or(i32::MAX),
            _ => return Ok(value),
        };
        self.pin(value);
        let object = Object::new(STRING_TYPE, vec![value, Value::i32(length)]);
        self.alloc(HeapObject::Object(object))
    }

    /// Text of a raw text value or a `String` object
    pub fn text_of(&self, value: Value) -> Option<String> {
        match self.heap.deref(value)? {
            HeapObject::Text(s) => Some(s.clone()),
            HeapObject::Object(o) if o.ty == STRING_TYPE => match self.heap.deref(o.get(0)?)? {
                HeapObject::Text(s) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Guest string conversion
    pub fn display(&self, value: Value) -> String {
        match value.kind() {
            ValueKind::Null => "null".to_string(),
            ValueKind::Bool => value.as_bool().unwrap_or_default().to_string(),
            ValueKind::Int => value.as_i32().unwrap_or_default().to_string(),
            ValueKind::Float | ValueKind::Single => value.as_number().unwrap_or_default().to_string(),
            ValueKind::Ref => {
                if let Some(text) = self.text_of(value) {
                    return text;
                }
                match self.heap.deref(value) {
                    Some(HeapObject::Object(o)) => self
                        .program
                        .as_ref()
                        .map(|p| p.type_name(o.ty).to_string())
                        .unwrap_or_else(|| "object".to_string()),
                    Some(HeapObject::Closure(_)) => "<function>".to_string(),
                    _ => "null".to_string(),
                }
            }
        }
    }

    // ========================================================================
    // Objects and statics
    // ========================================================================

    /// Global instance of a type; exists once the entry point has run
    pub fn global(&self, ty: TypeId) -> Option<Value> {
        self.globals.get(ty as usize).copied().flatten()
    }

    fn object(&self, value: Value) -> VmResult<&Object> {
        if value.is_null() {
            return Err(VmError::NullAccess("object is null".to_string()));
        }
        match self.heap.deref(value) {
            Some(HeapObject::Object(o)) => Ok(o),
            Some(other) => Err(VmError::TypeError(format!("expected object, got {}", other.kind_name()))),
            None => Err(VmError::NullAccess("object was collected".to_string())),
        }
    }

    fn object_mut(&mut self, value: Value) -> VmResult<&mut Object> {
        if value.is_null() {
            return Err(VmError::NullAccess("object is null".to_string()));
        }
        match self.heap.deref_mut(value) {
            Some(HeapObject::Object(o)) => Ok(o),
            Some(other) => Err(VmError::TypeError(format!("expected object, got {}", other.kind_name()))),
            None => Err(VmError::NullAccess("object was collected".to_string())),
        }
    }

    fn global_of(&self, ty: TypeId) -> VmResult<Value> {
        self.global(ty).ok_or_else(|| {
            let name = self
                .program
                .as_ref()
                .map(|p| p.type_name(ty).to_string())
                .unwrap_or_default();
            VmError::NotInitialized(name)
        })
    }

    /// Read a static field
    pub fn get_static(&self, ty: TypeId, slot: u16) -> VmResult<Value> {
        let global = self.global_of(ty)?;
        self.object(global)?
            .get(slot)
            .ok_or_else(|| VmError::FieldNotFound(format!("static slot {}", slot)))
    }

    /// Write a static field
    pub fn set_static(&mut self, ty: TypeId, slot: u16, value: Value) -> VmResult<()> {
        let global = self.global_of(ty)?;
        if self.object_mut(global)?.set(slot, value) {
            Ok(())
        } else {
            Err(VmError::FieldNotFound(format!("static slot {}", slot)))
        }
    }

    /// Read an instance field
    pub fn get_field(&self, object: Value, slot: u16) -> VmResult<Value> {
        self.object(object)?
            .get(slot)
            .ok_or_else(|| VmError::FieldNotFound(format!("field slot {}", slot)))
    }

    /// Write an instance field
    pub fn set_field(&mut self, object: Value, slot: u16, value: Value) -> VmResult<()> {
        if self.object_mut(object)?.set(slot, value) {
            Ok(())
        } else {
            Err(VmError::FieldNotFound(format!("field slot {}", slot)))
        }
    }

    /// Class of an object; `String` for both string representations
    pub fn type_of(&self, value: Value) -> Option<TypeId> {
        match self.heap.deref(value)? {
            HeapObject::Object(o) => Some(o.ty),
            HeapObject::Text(_) => Some(STRING_TYPE),
            HeapObject::Closure(_) => None,
        }
    }

    /// Whether `value` is an instance of `ty` or one of its subclasses
    pub fn is_instance_of(&self, value: Value, ty: TypeId) -> bool {
        match (self.type_of(value), self.program.as_ref()) {
            (Some(actual), Some(program)) => program.is_subtype(actual, ty),
            _ => false,
        }
    }

    /// Allocate an instance with default field values, without running a
    /// constructor
    pub fn alloc_instance(&mut self, ty: TypeId) -> VmResult<Value> {
        let fields: Vec<Value> = self
            .program_ref()?
            .type_def(ty)
            .ok_or_else(|| VmError::TypeError(format!("unknown type {}", ty)))?
            .fields
            .iter()
            .map(|f| f.ty.default_value())
            .collect();
        self.alloc(HeapObject::Object(Object::new(ty, fields)))
    }

    // ========================================================================
    // Closures
    // ========================================================================

    /// Wrap a host function in a guest closure
    pub fn alloc_native_closure(&mut self, native: Arc<dyn NativeFunction>) -> VmResult<Value> {
        self.alloc(HeapObject::Closure(Closure {
            target: ClosureTarget::Native(native),
            bound: None,
        }))
    }

    /// Create a closure over a bytecode function
    pub fn alloc_closure(&mut self, func: FunctionId, bound: Option<Value>) -> VmResult<Value> {
        if let Some(b) = bound {
            self.pin(b);
        }
        self.alloc(HeapObject::Closure(Closure {
            target: ClosureTarget::Function(func),
            bound,
        }))
    }

    /// Whether `value` is a closure
    pub fn is_closure(&self, value: Value) -> bool {
        matches!(self.heap.deref(value), Some(HeapObject::Closure(_)))
    }

    /// Declared signature of a function
    pub fn function_signature(&self, func: FunctionId) -> Option<Signature> {
        self.program.as_ref()?.function(func).map(|f| f.signature.clone())
    }

    /// Declared signature of a closure
    pub fn closure_signature(&self, value: Value) -> Option<Signature> {
        match self.heap.deref(value)? {
            HeapObject::Closure(c) => match &c.target {
                ClosureTarget::Function(f) => self.function_signature(*f),
                ClosureTarget::Native(n) => Some(n.signature()),
            },
            _ => None,
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Queue `callback` to run once `delay_ms` of pumped time has passed
    pub fn schedule(&mut self, callback: Value, delay_ms: f64) -> VmResult<u64> {
        if !self.is_closure(callback) {
            return Err(VmError::TypeError("scheduled callback is not a function".to_string()));
        }
        Ok(self.events.schedule(callback, delay_ms))
    }

    /// Whether timers are queued
    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Advance event time by `dt_ms` and run every timer that became due,
    /// in due order. Returns the number of callbacks run.
    pub fn pump_events(&mut self, dt_ms: f64) -> VmResult<usize> {
        let due = self.events.advance(dt_ms);
        for timer in &due {
            self.pin(timer.callback);
        }
        let mut ran = 0;
        let mut pending = due.into_iter();
        while let Some(timer) = pending.next() {
            if let Err(err) = self.call_value(timer.callback, &[]) {
                self.events.requeue(pending);
                return Err(err);
            }
            ran += 1;
        }
        Ok(ran)
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("heap", &self.heap)
            .field("loaded", &self.program.is_some())
            .field("entry_executed", &self.entry_executed)
            .field("frames", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::add_root;

    #[test]
    fn test_alloc_outside_scope_is_refused() {
        let mut vm = Vm::new(VmOptions::default());
        assert!(matches!(vm.alloc_text("x"), Err(VmError::StaleStackTop)));
        let v = vm.with_native_scope(|vm| vm.alloc_text("x")).unwrap();
        assert_eq!(vm.text_of(v).as_deref(), Some("x"));
    }

    #[test]
    fn test_promote_text_builds_string_object() {
        let mut vm = Vm::new(VmOptions::default());
        let s = vm
            .with_native_scope(|vm| {
                let raw = vm.alloc_text("héllo")?;
                vm.promote_text(raw)
            })
            .unwrap();
        assert!(vm.is_string(s));
        assert!(!vm.is_raw_text(s));
        assert_eq!(vm.text_of(s).as_deref(), Some("héllo"));
    }

    #[test]
    fn test_rooted_value_survives_collection() {
        let mut vm = Vm::new(VmOptions::default());
        let (kept, lost) = vm
            .with_native_scope(|vm| Ok::<_, VmError>((vm.alloc_text("kept")?, vm.alloc_text("lost")?)))
            .unwrap();
        let guard = add_root(vm.heap_id(), kept);
        vm.collect_garbage();
        assert!(vm.is_live(kept));
        assert!(!vm.is_live(lost));

        drop(guard);
        vm.collect_garbage();
        assert!(!vm.is_live(kept));
        assert_eq!(vm.text_of(kept), None);
    }

    #[test]
    fn test_display_primitives() {
        let vm = Vm::new(VmOptions::default());
        assert_eq!(vm.display(Value::i32(42)), "42");
        assert_eq!(vm.display(Value::f64(2.5)), "2.5");
        assert_eq!(vm.display(Value::bool(true)), "true");
        assert_eq!(vm.display(Value::null()), "null");
    }
}
