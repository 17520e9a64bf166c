//! Garbage collection
//!
//! - [`heap`]: slot heap, native scan window, mark-sweep collector
//! - [`roots`]: process-wide root table shared by all heaps

pub mod heap;
pub mod roots;

pub use heap::{GcStats, Heap, HeapId, ScopeMark};
pub use roots::{add_root, RootGuard};
