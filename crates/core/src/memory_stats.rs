//! Heap diagnostics: a read-only snapshot of collector activity.
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │              HeapStats                │
//! ├───────────────────────────────────────┤
//! │ capacity_bytes     (active semispace) │
//! │ allocated_bytes    (bump offset)      │
//! │ collections_run                       │
//! │ last_reclaimed_bytes                  │
//! └───────────────────────────────────────┘
//! ```
//!
//! The heap here belongs to exactly one mutator (see the crate's
//! concurrency notes), so unlike a cross-thread registry this is a
//! plain snapshot taken on demand — no atomics, no thread-local slots.
//! Querying it has no effect on collection policy.

use crate::heap::Heap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity_bytes: usize,
    pub allocated_bytes: usize,
    pub collections_run: u64,
    pub last_reclaimed_bytes: usize,
}

pub fn snapshot(heap: &Heap) -> HeapStats {
    HeapStats {
        capacity_bytes: heap.capacity(),
        allocated_bytes: heap.bytes_allocated(),
        collections_run: heap.collections_run(),
        last_reclaimed_bytes: heap.last_reclaimed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::NoopReaper;

    #[test]
    fn snapshot_reflects_allocation() {
        let mut heap = Heap::new(4096);
        let before = snapshot(&heap);
        let _ = heap.alloc_string("x").unwrap();
        let after = snapshot(&heap);
        assert!(after.allocated_bytes > before.allocated_bytes);
        assert_eq!(after.collections_run, 0);
    }

    #[test]
    fn snapshot_reflects_collection_count() {
        let mut heap = Heap::new(256);
        let mut reaper = NoopReaper;
        let mut no_roots = |_apply: &mut dyn FnMut(&mut crate::value::Handle)| {};
        heap.collect(&mut no_roots, &mut reaper);
        assert_eq!(snapshot(&heap).collections_run, 1);
    }
}
