//! Host-side value handles
//!
//! A [`ValueHandle`] wraps one guest value. Primitive handles own no guest
//! memory. Handles to heap objects come in two flavours:
//!
//! - **ephemeral**: returned by field reads and calls. Nothing keeps the
//!   object alive, so the handle is only good until the next guest
//!   allocation; a stale handle is detected (slot generations) and reported
//!   as a null reference rather than aliasing another object.
//! - **rooted**: returned by instance construction and by
//!   [`Runtime::root`](crate::Runtime::root). The object stays reachable
//!   until the handle is dropped.

use ember_core::{add_root, HeapId, RootGuard, Value, ValueKind};

/// Host-side handle to a guest value
#[derive(Debug)]
pub struct ValueHandle {
    value: Value,
    heap: Option<HeapId>,
    root: Option<RootGuard>,
}

impl ValueHandle {
    /// Null
    pub fn null() -> Self {
        Self::primitive(Value::null())
    }

    /// 32-bit integer
    pub fn int(i: i32) -> Self {
        Self::primitive(Value::i32(i))
    }

    /// 64-bit float
    pub fn float(f: f64) -> Self {
        Self::primitive(Value::f64(f))
    }

    /// 32-bit float
    pub fn single(f: f32) -> Self {
        Self::primitive(Value::f32(f))
    }

    /// Boolean
    pub fn bool(b: bool) -> Self {
        Self::primitive(Value::bool(b))
    }

    fn primitive(value: Value) -> Self {
        Self {
            value,
            heap: None,
            root: None,
        }
    }

    /// Wrap a value without rooting it
    pub(crate) fn ephemeral(value: Value, heap: HeapId) -> Self {
        Self {
            value,
            heap: value.is_ref().then_some(heap),
            root: None,
        }
    }

    /// Wrap a value and root it for as long as the handle lives
    pub(crate) fn rooted(value: Value, heap: HeapId) -> Self {
        if !value.is_ref() {
            return Self::primitive(value);
        }
        Self {
            value,
            heap: Some(heap),
            root: Some(add_root(heap, value)),
        }
    }

    /// Unrooted copy of this handle
    pub(crate) fn share(&self) -> Self {
        Self {
            value: self.value,
            heap: self.heap,
            root: None,
        }
    }

    /// Underlying guest value
    pub fn raw(&self) -> Value {
        self.value
    }

    /// Heap the referenced object lives in; `None` for primitives
    pub fn heap(&self) -> Option<HeapId> {
        self.heap
    }

    /// Whether the handle keeps its object alive
    pub fn is_rooted(&self) -> bool {
        self.root.is_some()
    }

    /// Whether the handle holds null
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Value kind
    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }

    /// Integer content. Floats truncate, booleans map to 0/1, anything
    /// else yields `default`.
    pub fn as_int(&self, default: i32) -> i32 {
        match self.value.kind() {
            ValueKind::Int => self.value.as_i32().unwrap_or(default),
            ValueKind::Float | ValueKind::Single => self.value.as_number().map(|f| f as i32).unwrap_or(default),
            ValueKind::Bool => self.value.as_bool().map(i32::from).unwrap_or(default),
            _ => default,
        }
    }

    /// Float content; integers and singles widen
    pub fn as_float(&self, default: f64) -> f64 {
        self.value.as_number().unwrap_or(default)
    }

    /// Single-precision content
    pub fn as_single(&self, default: f32) -> f32 {
        match self.value.kind() {
            ValueKind::Single => self.value.as_f32().unwrap_or(default),
            _ => self.value.as_number().map(|f| f as f32).unwrap_or(default),
        }
    }

    /// Boolean content; integers are true when non-zero
    pub fn as_bool(&self, default: bool) -> bool {
        match self.value.kind() {
            ValueKind::Bool => self.value.as_bool().unwrap_or(default),
            ValueKind::Int => self.value.as_i32().map(|i| i != 0).unwrap_or(default),
            _ => default,
        }
    }

    /// Release the handle and its root, if any
    pub fn free(self) {
        drop(self);
    }
}

impl Default for ValueHandle {
    fn default() -> Self {
        Self::null()
    }
}

impl From<i32> for ValueHandle {
    fn from(i: i32) -> Self {
        Self::int(i)
    }
}

impl From<f64> for ValueHandle {
    fn from(f: f64) -> Self {
        Self::float(f)
    }
}

impl From<bool> for ValueHandle {
    fn from(b: bool) -> Self {
        Self::bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unboxing_with_defaults() {
        assert_eq!(ValueHandle::int(7).as_int(0), 7);
        assert_eq!(ValueHandle::float(2.9).as_int(0), 2);
        assert_eq!(ValueHandle::bool(true).as_int(0), 1);
        assert_eq!(ValueHandle::null().as_int(-1), -1);

        assert_eq!(ValueHandle::int(3).as_float(0.0), 3.0);
        assert_eq!(ValueHandle::single(1.5).as_float(0.0), 1.5);
        assert_eq!(ValueHandle::null().as_float(9.5), 9.5);

        assert!(ValueHandle::int(2).as_bool(false));
        assert!(!ValueHandle::int(0).as_bool(true));
        assert!(ValueHandle::null().as_bool(true));
    }

    #[test]
    fn test_primitives_are_not_rooted() {
        let heap = HeapId::new();
        let h = ValueHandle::rooted(Value::i32(5), heap);
        assert!(!h.is_rooted());
        assert_eq!(h.heap(), None);
        assert!(ValueHandle::null().is_null());
    }

    #[test]
    fn test_rooted_handle_releases_on_drop() {
        let heap = HeapId::new();
        let fake = Value::from_ref(ember_core::value::GcRef {
            index: 3,
            generation: 0,
        });
        let h = ValueHandle::rooted(fake, heap);
        assert!(h.is_rooted());
        assert_eq!(ember_core::gc::roots::count_for(heap), 1);
        h.free();
        assert_eq!(ember_core::gc::roots::count_for(heap), 0);
    }
}
