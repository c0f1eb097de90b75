//! Preallocated sentinels: the sentinel value, the out-of-heap
//! exception, and the finalization-failure exception.
//!
//! All three are constructed once via [`Heap::alloc_permanent_symbol`] /
//! [`Heap::alloc_permanent_exception`] outside either semispace, so
//! [`Heap::collect`] never evacuates or reclaims them — they live for
//! as long as the heap itself does, by pointer identity. They must be
//! installed before any ordinary allocation so an out-of-heap condition
//! always has somewhere safe to point.

use crate::heap::Heap;
use crate::value::Handle;

pub struct Sentinels {
    /// A distinguishable default, returned by lookup APIs like
    /// `map::get_or_else` in place of a "not found" value.
    pub sentinel: Handle,
    pub out_of_heap: Handle,
    pub finalization_failure: Handle,
}

impl Sentinels {
    pub fn install(heap: &mut Heap) -> Sentinels {
        Sentinels {
            sentinel: heap.alloc_permanent_symbol("#sentinel"),
            out_of_heap: heap.alloc_permanent_exception("out of heap"),
            finalization_failure: heap.alloc_permanent_exception("module finalization failed"),
        }
    }
}
