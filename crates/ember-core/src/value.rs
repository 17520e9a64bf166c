//! NaN-boxed value representation
//!
//! Every guest value fits in 64 bits. Floats are stored as raw IEEE 754
//! doubles; everything else lives in the negative quiet-NaN space.
//!
//! # Encoding
//!
//! ```text
//! f64 (float): Any value where upper 13 bits != 0x1FFF (raw IEEE 754)
//! Tagged:      0xFFF8 + 3-bit tag + 48-bit payload (NaN-boxed)
//!   - Ref:       0xFFF8000000000000 | (generation << 32) | slot   [tag=000]
//!   - i32 (int): 0xFFF8001000000000 | (i32 as u32)                [tag=001]
//!   - bool:      0xFFF8002000000000 | (b as u64)                  [tag=010]
//!   - f32:       0xFFF8004000000000 | (f32.to_bits() as u64)      [tag=100]
//!   - null:      0xFFF8006000000000                               [tag=110]
//! ```
//!
//! Heap references carry a slot index and the slot's generation, so a
//! reference that outlived its object never aliases a newer allocation.

use std::fmt;

/// NaN-boxed guest value
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

const NAN_BOX_BASE: u64 = 0xFFF8_0000_0000_0000;
const TAG_SHIFT: u64 = 48;
const TAG_MASK: u64 = 0x7 << TAG_SHIFT;
const PAYLOAD_MASK_32: u64 = 0x0000_0000_FFFF_FFFF;

const TAG_REF: u64 = 0x0 << TAG_SHIFT;
const TAG_I32: u64 = 0x1 << TAG_SHIFT;
const TAG_BOOL: u64 = 0x2 << TAG_SHIFT;
const TAG_F32: u64 = 0x4 << TAG_SHIFT;
const TAG_NULL: u64 = 0x6 << TAG_SHIFT;

const NULL_BITS: u64 = NAN_BOX_BASE | TAG_NULL;
const TRUE_BITS: u64 = NAN_BOX_BASE | TAG_BOOL | 1;
const FALSE_BITS: u64 = NAN_BOX_BASE | TAG_BOOL;

// Positive quiet NaN: never collides with the boxed space
const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

/// Reference to a heap slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef {
    /// Slot index in the heap
    pub index: u32,
    /// Generation of the slot when the reference was created
    pub generation: u16,
}

/// Coarse classification of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Guest null
    Null,
    /// Boolean
    Bool,
    /// 32-bit integer
    Int,
    /// 64-bit float
    Float,
    /// 32-bit float
    Single,
    /// Heap reference
    Ref,
}

impl Value {
    // ========================================================================
    // Constructors
    // ========================================================================

    /// Create a null value
    #[inline]
    pub const fn null() -> Self {
        Self(NULL_BITS)
    }

    /// Create a boolean value
    #[inline]
    pub const fn bool(b: bool) -> Self {
        Self(if b { TRUE_BITS } else { FALSE_BITS })
    }

    /// Create an i32 value
    #[inline]
    pub const fn i32(i: i32) -> Self {
        Self(NAN_BOX_BASE | TAG_I32 | (i as u32 as u64))
    }

    /// Create an f64 value. NaN payloads are canonicalized.
    #[inline]
    pub fn f64(f: f64) -> Self {
        if f.is_nan() {
            Self(CANONICAL_NAN)
        } else {
            Self(f.to_bits())
        }
    }

    /// Create an f32 value
    #[inline]
    pub fn f32(f: f32) -> Self {
        Self(NAN_BOX_BASE | TAG_F32 | (f.to_bits() as u64))
    }

    /// Create a heap reference
    #[inline]
    pub const fn from_ref(r: GcRef) -> Self {
        Self(NAN_BOX_BASE | TAG_REF | ((r.generation as u64) << 32) | r.index as u64)
    }

    /// Raw bits
    #[inline(always)]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    // ========================================================================
    // Type checks
    // ========================================================================

    #[inline]
    const fn is_nan_boxed(&self) -> bool {
        (self.0 & NAN_BOX_BASE) == NAN_BOX_BASE
    }

    #[inline]
    const fn tag(&self) -> u64 {
        self.0 & TAG_MASK
    }

    /// Check if value is null
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == NULL_BITS
    }

    /// Check if value is a heap reference
    #[inline]
    pub const fn is_ref(&self) -> bool {
        self.is_nan_boxed() && self.tag() == TAG_REF
    }

    /// Classify the value
    pub const fn kind(&self) -> ValueKind {
        if !self.is_nan_boxed() {
            return ValueKind::Float;
        }
        match self.tag() {
            TAG_REF => ValueKind::Ref,
            TAG_I32 => ValueKind::Int,
            TAG_BOOL => ValueKind::Bool,
            TAG_F32 => ValueKind::Single,
            _ => ValueKind::Null,
        }
    }

    // ========================================================================
    // Extraction
    // ========================================================================

    /// Get as bool
    #[inline]
    pub const fn as_bool(&self) -> Option<bool> {
        if self.is_nan_boxed() && self.tag() == TAG_BOOL {
            Some(self.0 & 1 == 1)
        } else {
            None
        }
    }

    /// Get as i32
    #[inline]
    pub const fn as_i32(&self) -> Option<i32> {
        if self.is_nan_boxed() && self.tag() == TAG_I32 {
            Some((self.0 & PAYLOAD_MASK_32) as u32 as i32)
        } else {
            None
        }
    }

    /// Get as f64
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        if self.is_nan_boxed() {
            None
        } else {
            Some(f64::from_bits(self.0))
        }
    }

    /// Get as f32
    #[inline]
    pub fn as_f32(&self) -> Option<f32> {
        if self.is_nan_boxed() && self.tag() == TAG_F32 {
            Some(f32::from_bits((self.0 & PAYLOAD_MASK_32) as u32))
        } else {
            None
        }
    }

    /// Any numeric kind widened to f64
    pub fn as_number(&self) -> Option<f64> {
        match self.kind() {
            ValueKind::Int => self.as_i32().map(f64::from),
            ValueKind::Float => self.as_f64(),
            ValueKind::Single => self.as_f32().map(f64::from),
            _ => None,
        }
    }

    /// Get the heap reference
    #[inline]
    pub const fn as_gc_ref(&self) -> Option<GcRef> {
        if self.is_ref() {
            Some(GcRef {
                index: (self.0 & PAYLOAD_MASK_32) as u32,
                generation: ((self.0 >> 32) & 0xFFFF) as u16,
            })
        } else {
            None
        }
    }

    /// Guest truthiness: null, false, zero and NaN are falsy
    pub fn is_truthy(&self) -> bool {
        match self.kind() {
            ValueKind::Null => false,
            ValueKind::Bool => self.0 & 1 == 1,
            ValueKind::Int => self.as_i32() != Some(0),
            ValueKind::Float | ValueKind::Single => {
                self.as_number().map(|n| n != 0.0 && !n.is_nan()).unwrap_or(false)
            }
            ValueKind::Ref => true,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ValueKind::Null => write!(f, "Null"),
            ValueKind::Bool => write!(f, "Bool({})", self.0 & 1 == 1),
            ValueKind::Int => write!(f, "Int({})", self.as_i32().unwrap_or_default()),
            ValueKind::Float => write!(f, "Float({})", f64::from_bits(self.0)),
            ValueKind::Single => write!(f, "Single({})", self.as_f32().unwrap_or_default()),
            ValueKind::Ref => match self.as_gc_ref() {
                Some(r) => write!(f, "Ref({}#{})", r.index, r.generation),
                None => write!(f, "Ref(?)"),
            },
        }
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::i32(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::f64(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediates_round_trip() {
        assert_eq!(Value::i32(-7).as_i32(), Some(-7));
        assert_eq!(Value::i32(i32::MIN).as_i32(), Some(i32::MIN));
        assert_eq!(Value::bool(true).as_bool(), Some(true));
        assert_eq!(Value::f64(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::f32(1.25).as_f32(), Some(1.25));
        assert!(Value::null().is_null());
    }

    #[test]
    fn test_kinds_do_not_overlap() {
        assert_eq!(Value::i32(1).as_bool(), None);
        assert_eq!(Value::bool(true).as_i32(), None);
        assert_eq!(Value::f64(1.0).as_i32(), None);
        assert_eq!(Value::null().as_gc_ref(), None);
        assert_eq!(Value::f64(f64::NEG_INFINITY).kind(), ValueKind::Float);
    }

    #[test]
    fn test_nan_is_canonicalized() {
        let nan = Value::f64(-f64::NAN);
        assert_eq!(nan.kind(), ValueKind::Float);
        assert!(nan.as_f64().map(f64::is_nan).unwrap_or(false));
        assert!(!nan.is_truthy());
    }

    #[test]
    fn test_ref_encoding() {
        let r = GcRef { index: 42, generation: 7 };
        let v = Value::from_ref(r);
        assert!(v.is_ref());
        assert_eq!(v.as_gc_ref(), Some(r));
        assert_ne!(v, Value::from_ref(GcRef { index: 42, generation: 8 }));
    }
}
