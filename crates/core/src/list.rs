//! Persistent cons lists.
//!
//! A list is either the null handle (empty) or a `List` value holding a
//! head, a tail, and a cached length. Every operation here allocates;
//! none mutates an existing cons cell.

use crate::heap::{GcResult, Heap, LibraryReaper};
use crate::value::{self, Handle};

/// `length(list(head, tail)) == 1 + length(tail)`.
///
/// # Safety
/// `xs` must be null or a live List handle.
pub unsafe fn length(xs: Handle) -> u64 {
    unsafe { xs.list_length() }
}

/// Conses `head` onto `tail`, rooting both across the allocation.
pub fn cons(heap: &mut Heap, mut head: Handle, mut tail: Handle, reaper: &mut dyn LibraryReaper) -> GcResult<Handle> {
    heap.alloc_list(&mut head, &mut tail, reaper)
}

/// Reverses `xs` in `length(xs)` allocations. `reverse(reverse(xs)) ==
/// xs` for any acyclic list.
pub fn reverse(heap: &mut Heap, xs: Handle, reaper: &mut dyn LibraryReaper) -> GcResult<Handle> {
    let mut acc = Handle::NULL;
    // `cur` walks the original list; `acc` accumulates the reversed
    // prefix. `acc` is rooted by `alloc_list` itself; the unconsumed
    // remainder of the input is only reachable through `cur`, so it
    // needs its own scratch root across each cons allocation.
    let cur_root = heap.push_scratch(xs);
    while !heap.scratch_get(cur_root).is_null() {
        let cur = heap.scratch_get(cur_root);
        let mut head = unsafe { cur.list_head() };
        let next = unsafe { cur.list_tail() };
        heap.set_scratch(cur_root, next);
        acc = heap.alloc_list(&mut head, &mut acc, reaper)?;
    }
    heap.pop_scratch_to(cur_root);
    Ok(acc)
}

/// Structural equality, delegating to [`value::equals`].
///
/// # Safety
/// Both handles must be null or live List handles.
pub unsafe fn equals(a: Handle, b: Handle) -> bool {
    unsafe { value::equals(a, b) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::NoopReaper;

    fn sym(heap: &mut Heap, s: &str) -> Handle {
        heap.alloc_symbol(s).unwrap()
    }

    #[test]
    fn reverse_twice_is_identity() {
        let mut heap = Heap::new(4096);
        let mut reaper = NoopReaper;
        let a = sym(&mut heap, "a");
        let b = sym(&mut heap, "b");
        let c = sym(&mut heap, "c");
        let xs = cons(&mut heap, a, Handle::NULL, &mut reaper).unwrap();
        let xs = cons(&mut heap, b, xs, &mut reaper).unwrap();
        let xs = cons(&mut heap, c, xs, &mut reaper).unwrap();

        let once = reverse(&mut heap, xs, &mut reaper).unwrap();
        let twice = reverse(&mut heap, once, &mut reaper).unwrap();
        assert!(unsafe { equals(xs, twice) });
        assert_eq!(unsafe { length(xs) }, 3);
    }

    #[test]
    fn cons_grows_length_by_one() {
        let mut heap = Heap::new(4096);
        let mut reaper = NoopReaper;
        let a = sym(&mut heap, "a");
        let xs = cons(&mut heap, a, Handle::NULL, &mut reaper).unwrap();
        let b = sym(&mut heap, "b");
        let ys = cons(&mut heap, b, xs, &mut reaper).unwrap();
        assert_eq!(unsafe { length(ys) }, unsafe { length(xs) } + 1);
    }

    #[test]
    fn reverse_does_not_mutate_input() {
        let mut heap = Heap::new(4096);
        let mut reaper = NoopReaper;
        let a = sym(&mut heap, "a");
        let b = sym(&mut heap, "b");
        let xs = cons(&mut heap, a, Handle::NULL, &mut reaper).unwrap();
        let xs = cons(&mut heap, b, xs, &mut reaper).unwrap();
        let before_head = unsafe { xs.list_head().as_str() }.to_string();
        let _ = reverse(&mut heap, xs, &mut reaper).unwrap();
        assert_eq!(unsafe { xs.list_head().as_str() }, before_head);
    }
}
