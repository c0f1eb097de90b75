//! Result-or-exception discipline for the native ABI.
//!
//! Every allocating or stack-manipulating helper in this crate returns
//! `Result<Handle, Handle>`: `Ok(value)` on success, `Err(exception)`
//! on failure. The `?` operator threads this up the native call chain
//! exactly where the source used macro-based `BOWL_TRY` substitution —
//! see the core crate's design notes for why that pattern was dropped.
//!
//! Building an exception is itself an allocation and can itself run out
//! of heap, so every helper here takes the preallocated `out_of_heap`
//! sentinel and substitutes it rather than recursing into its own
//! failure path.
//!
//! At the outermost native-function boundary (an `extern "C" fn`
//! resolved out of a loaded module) there is no `Result` to return —
//! the ABI is a single `Handle` — so [`into_abi_result`] collapses
//! `Result<Handle, Handle>` into that convention: push on success,
//! return the exception (or the null handle) either way.

use bowl_core::heap::{GcResult, Heap, LibraryReaper};
use bowl_core::stack;
use bowl_core::value::{Handle, Tag};

/// Collapses an allocator failure into the preallocated sentinel.
fn or_out_of_heap<T>(result: GcResult<T>, out_of_heap: Handle) -> Result<T, Handle> {
    result.map_err(|_| out_of_heap)
}

/// Allocates a causeless exception whose message is the given string.
pub fn format_exception(
    heap: &mut Heap,
    reaper: &mut dyn LibraryReaper,
    out_of_heap: Handle,
    message: &str,
) -> Result<Handle, Handle> {
    let mut message_h = or_out_of_heap(heap.alloc_string(message), out_of_heap)?;
    let mut cause = Handle::NULL;
    or_out_of_heap(heap.alloc_exception(&mut cause, &mut message_h, reaper), out_of_heap)
}

/// Wraps `message` with a cause chain link to `cause`.
pub fn exception(
    heap: &mut Heap,
    reaper: &mut dyn LibraryReaper,
    out_of_heap: Handle,
    mut cause: Handle,
    mut message: Handle,
) -> Result<Handle, Handle> {
    or_out_of_heap(heap.alloc_exception(&mut cause, &mut message, reaper), out_of_heap)
}

/// Pops the top of `*datastack`, naming `function_name` in the
/// stack-underflow exception if it is empty.
pub fn try_pop(
    heap: &mut Heap,
    reaper: &mut dyn LibraryReaper,
    out_of_heap: Handle,
    datastack: &mut Handle,
    function_name: &str,
) -> Result<Handle, Handle> {
    match stack::pop(datastack) {
        Some(value) => Ok(value),
        None => Err(format_exception(
            heap,
            reaper,
            out_of_heap,
            &format!("stack underflow in {function_name}"),
        )?),
    }
}

/// Pushes `value` onto `*datastack`, translating an allocator failure
/// into `out_of_heap`.
pub fn try_push(
    heap: &mut Heap,
    reaper: &mut dyn LibraryReaper,
    out_of_heap: Handle,
    datastack: &mut Handle,
    value: Handle,
) -> Result<(), Handle> {
    or_out_of_heap(stack::push(heap, datastack, value, reaper), out_of_heap)
}

/// Asserts `value` carries `expected`; on mismatch builds a type-error
/// exception naming the actual and expected type plus `function_name`.
/// The null handle is treated as satisfying [`Tag::List`] only (the
/// empty-list convention) and nothing else.
pub fn expect_tag(
    heap: &mut Heap,
    reaper: &mut dyn LibraryReaper,
    out_of_heap: Handle,
    value: Handle,
    expected: Tag,
    function_name: &str,
) -> Result<Handle, Handle> {
    if value.is_null() {
        return if expected == Tag::List {
            Ok(value)
        } else {
            Err(format_exception(
                heap,
                reaper,
                out_of_heap,
                &format!("{function_name}: expected {expected:?}, got empty list"),
            )?)
        };
    }
    let actual = unsafe { value.tag() };
    if actual == expected {
        return Ok(value);
    }
    Err(format_exception(
        heap,
        reaper,
        out_of_heap,
        &format!("{function_name}: expected {expected:?}, got {actual:?}"),
    )?)
}

/// Converts a result produced by native-function logic into the single
/// `Handle` the ABI boundary expects: on success the value is pushed
/// onto `*datastack` and the null handle (no exception) is returned; on
/// failure the exception is returned directly.
pub fn into_abi_result(
    heap: &mut Heap,
    reaper: &mut dyn LibraryReaper,
    out_of_heap: Handle,
    datastack: &mut Handle,
    result: Result<Handle, Handle>,
) -> Handle {
    match result {
        Ok(value) => match try_push(heap, reaper, out_of_heap, datastack, value) {
            Ok(()) => Handle::NULL,
            Err(exc) => exc,
        },
        Err(exc) => exc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bowl_core::heap::NoopReaper;
    use bowl_core::sentinel::Sentinels;

    #[test]
    fn stack_underflow_names_the_caller() {
        let mut heap = Heap::new(4096);
        let sentinels = Sentinels::install(&mut heap);
        let mut reaper = NoopReaper;
        let mut datastack = Handle::NULL;
        let err = try_pop(&mut heap, &mut reaper, sentinels.out_of_heap, &mut datastack, "f").unwrap_err();
        let message = unsafe { err.exception_message().as_str() };
        assert!(message.contains("stack underflow"));
        assert!(message.contains('f'));
    }

    #[test]
    fn type_mismatch_names_both_types() {
        let mut heap = Heap::new(4096);
        let sentinels = Sentinels::install(&mut heap);
        let mut reaper = NoopReaper;
        let n = heap.alloc_number(1.0).unwrap();
        let err =
            expect_tag(&mut heap, &mut reaper, sentinels.out_of_heap, n, Tag::String, "car").unwrap_err();
        let message = unsafe { err.exception_message().as_str() };
        assert!(message.contains("car"));
        assert!(message.contains("String"));
        assert!(message.contains("Number"));
    }

    #[test]
    fn null_satisfies_list_but_not_string() {
        let mut heap = Heap::new(4096);
        let sentinels = Sentinels::install(&mut heap);
        let mut reaper = NoopReaper;
        assert!(expect_tag(
            &mut heap,
            &mut reaper,
            sentinels.out_of_heap,
            Handle::NULL,
            Tag::List,
            "cdr"
        )
        .is_ok());
        assert!(expect_tag(
            &mut heap,
            &mut reaper,
            sentinels.out_of_heap,
            Handle::NULL,
            Tag::String,
            "cdr"
        )
        .is_err());
    }

    #[test]
    fn into_abi_result_pushes_on_success() {
        let mut heap = Heap::new(4096);
        let sentinels = Sentinels::install(&mut heap);
        let mut reaper = NoopReaper;
        let mut datastack = Handle::NULL;
        let value = heap.alloc_number(7.0).unwrap();
        let exc = into_abi_result(&mut heap, &mut reaper, sentinels.out_of_heap, &mut datastack, Ok(value));
        assert!(exc.is_null());
        assert_eq!(unsafe { datastack.list_head().as_number() }, 7.0);
    }
}
