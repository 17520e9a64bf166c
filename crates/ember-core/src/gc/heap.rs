//! Slot heap with mark-sweep collection
//!
//! Objects live in slots addressed by [`GcRef`]. Freeing a slot bumps its
//! generation, so references that outlived their object resolve to `None`.
//! A slot whose generation is exhausted is retired instead of wrapping.
//!
//! The collector scans, besides the roots handed in by the VM, a *native
//! scan window*: values pinned by embedder code that is currently inside a
//! native scope. Allocation is only permitted while such a scope is active,
//! i.e. after the stack top has been refreshed.

use super::roots;
use crate::object::HeapObject;
use crate::value::{GcRef, Value};
use crate::{VmError, VmResult};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u64);

impl HeapId {
    /// Create a new unique heap ID
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        HeapId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for HeapId {
    fn default() -> Self {
        Self::new()
    }
}

/// Collection statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Completed collections
    pub collections: u64,
    /// Objects freed over all collections
    pub objects_freed: u64,
    /// Objects alive after the last collection
    pub last_live: usize,
}

/// Marker returned by [`Heap::refresh_stack_top`]; restores the previous
/// scope when handed back to [`Heap::restore_stack_top`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct ScopeMark {
    previous_top: Option<usize>,
    window_len: usize,
}

struct Slot {
    generation: u16,
    marked: bool,
    object: Option<HeapObject>,
}

/// Garbage-collected heap
pub struct Heap {
    id: HeapId,
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    initial_threshold: usize,
    threshold: usize,
    max_objects: Option<usize>,
    scan_window: Vec<Value>,
    stack_top: Option<usize>,
    stats: GcStats,
}

impl Heap {
    /// Create a heap that collects once `threshold` objects are live
    pub fn new(threshold: usize, max_objects: Option<usize>) -> Self {
        let threshold = threshold.max(1);
        Self {
            id: HeapId::new(),
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            initial_threshold: threshold,
            threshold,
            max_objects,
            scan_window: Vec::new(),
            stack_top: None,
            stats: GcStats::default(),
        }
    }

    /// Heap identity, used to key the process-wide root table
    pub fn id(&self) -> HeapId {
        self.id
    }

    // ========================================================================
    // Native scan window
    // ========================================================================

    /// Mark the current top of the native scan window. Allocation is legal
    /// until the returned mark is restored.
    pub fn refresh_stack_top(&mut self) -> ScopeMark {
        let mark = ScopeMark {
            previous_top: self.stack_top,
            window_len: self.scan_window.len(),
        };
        self.stack_top = Some(self.scan_window.len());
        mark
    }

    /// Leave a native scope: drops the values pinned inside it
    pub fn restore_stack_top(&mut self, mark: ScopeMark) {
        self.scan_window.truncate(mark.window_len);
        self.stack_top = mark.previous_top;
    }

    /// Whether a native scope is active
    pub fn stack_top_is_fresh(&self) -> bool {
        self.stack_top.is_some()
    }

    /// Keep a value alive until the current native scope ends
    pub fn pin(&mut self, value: Value) {
        if value.is_ref() && self.stack_top.is_some() {
            self.scan_window.push(value);
        }
    }

    // ========================================================================
    // Allocation and access
    // ========================================================================

    /// Number of live objects
    pub fn live_objects(&self) -> usize {
        self.live
    }

    /// Collection statistics
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Whether the allocation threshold has been reached
    pub fn should_collect(&self) -> bool {
        self.live >= self.threshold
    }

    /// Store an object. Fails when no native scope is active or the heap
    /// limit is reached.
    pub fn insert(&mut self, object: HeapObject) -> VmResult<GcRef> {
        if !self.stack_top_is_fresh() {
            return Err(VmError::StaleStackTop);
        }
        if let Some(max) = self.max_objects {
            if self.live >= max {
                return Err(VmError::OutOfMemory);
            }
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| VmError::OutOfMemory)?;
                self.slots.push(Slot {
                    generation: 0,
                    marked: false,
                    object: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.object = Some(object);
        slot.marked = false;
        self.live += 1;

        Ok(GcRef {
            index,
            generation: slot.generation,
        })
    }

    /// Resolve a reference; `None` once the object was collected
    pub fn get(&self, r: GcRef) -> Option<&HeapObject> {
        self.slots
            .get(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.object.as_ref())
    }

    /// Resolve a reference mutably
    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut HeapObject> {
        self.slots
            .get_mut(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.object.as_mut())
    }

    /// Resolve a value holding a reference
    pub fn deref(&self, value: Value) -> Option<&HeapObject> {
        let r = value.as_gc_ref()?;
        self.get(r)
    }

    /// Resolve a value holding a reference mutably
    pub fn deref_mut(&mut self, value: Value) -> Option<&mut HeapObject> {
        let r = value.as_gc_ref()?;
        self.get_mut(r)
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Mark everything reachable from `vm_roots`, the native scan window and
    /// this heap's entries in the process-wide root table, then free the
    /// rest. Returns the number of objects freed.
    pub fn collect(&mut self, vm_roots: impl IntoIterator<Item = Value>) -> usize {
        let mut worklist: Vec<Value> = vm_roots.into_iter().filter(Value::is_ref).collect();
        worklist.extend(self.scan_window.iter().copied());
        worklist.extend(roots::values_for(self.id));

        while let Some(value) = worklist.pop() {
            let Some(r) = value.as_gc_ref() else { continue };
            let Some(slot) = self.slots.get_mut(r.index as usize) else {
                continue;
            };
            if slot.generation != r.generation || slot.marked {
                continue;
            }
            if let Some(object) = slot.object.as_ref() {
                slot.marked = true;
                object.trace(&mut worklist);
            }
        }

        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                slot.object = None;
                if slot.generation < u16::MAX {
                    slot.generation += 1;
                    self.free.push(index as u32);
                }
                freed += 1;
            }
        }

        self.live -= freed;
        self.threshold = (self.live * 2).max(self.initial_threshold);
        self.stats.collections += 1;
        self.stats.objects_freed += freed as u64;
        self.stats.last_live = self.live;

        log::debug!(
            "heap {}: collected {} objects, {} live",
            self.id.as_u64(),
            freed,
            self.live
        );
        freed
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.id)
            .field("live", &self.live)
            .field("threshold", &self.threshold)
            .finish()
    }
}
