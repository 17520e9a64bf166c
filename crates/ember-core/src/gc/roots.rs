//! Process-wide GC root table
//!
//! Embedders anchor guest values by registering them here. The table is
//! shared by every heap in the process and guarded by one mutex; each
//! entry records the heap it belongs to, and a heap only scans its own
//! entries. A [`RootGuard`] removes its entry when dropped.

use super::heap::HeapId;
use crate::value::Value;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

struct RootTable {
    next_id: u64,
    entries: FxHashMap<u64, (HeapId, Value)>,
}

static ROOTS: Lazy<Mutex<RootTable>> = Lazy::new(|| {
    Mutex::new(RootTable {
        next_id: 1,
        entries: FxHashMap::default(),
    })
});

/// Owned root. The value stays reachable until the guard is dropped.
#[derive(Debug)]
pub struct RootGuard {
    id: u64,
    heap: HeapId,
    value: Value,
}

impl RootGuard {
    /// The rooted value
    pub fn value(&self) -> Value {
        self.value
    }

    /// Heap the value lives in
    pub fn heap(&self) -> HeapId {
        self.heap
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        ROOTS.lock().entries.remove(&self.id);
    }
}

/// Register `value` as a root of `heap`
pub fn add_root(heap: HeapId, value: Value) -> RootGuard {
    let mut table = ROOTS.lock();
    let id = table.next_id;
    table.next_id += 1;
    table.entries.insert(id, (heap, value));
    RootGuard { id, heap, value }
}

/// Snapshot of the values rooted for `heap`
pub fn values_for(heap: HeapId) -> Vec<Value> {
    ROOTS
        .lock()
        .entries
        .values()
        .filter(|(owner, _)| *owner == heap)
        .map(|(_, value)| *value)
        .collect()
}

/// Number of roots registered for `heap`
pub fn count_for(heap: HeapId) -> usize {
    ROOTS
        .lock()
        .entries
        .values()
        .filter(|(owner, _)| *owner == heap)
        .count()
}
