//! Persistent hash maps.
//!
//! A map is a fixed-capacity array of buckets; each bucket is a flat
//! cons list alternating key, value, key, value, … The bucket for a
//! key is `hash(key) mod capacity`. Every operation below returns a
//! fresh map and never mutates an existing one; a rebuilt bucket only
//! reallocates the prefix up to the pair that changed.

use crate::heap::{GcResult, Heap, LibraryReaper};
use crate::list;
use crate::value::{self, Handle};

const DEFAULT_CAPACITY: u64 = 8;
const LOAD_FACTOR_NUM: u64 = 3;
const LOAD_FACTOR_DEN: u64 = 4;

pub fn empty(heap: &mut Heap, reaper: &mut dyn LibraryReaper) -> GcResult<Handle> {
    heap.alloc_map(DEFAULT_CAPACITY, reaper)
}

/// # Safety: `m` must be a live Map handle.
pub unsafe fn length(m: Handle) -> u64 {
    unsafe { m.map_length() }
}

fn bucket_index(heap_hash: u64, capacity: u64) -> u64 {
    heap_hash % capacity
}

/// Rebuilds a map with every bucket copied from `m` except bucket
/// `changed_index`, which becomes `new_bucket`, and with `new_length`
/// as the cached element count.
fn clone_with_bucket(
    heap: &mut Heap,
    m: Handle,
    changed_index: u64,
    new_bucket: Handle,
    new_length: u64,
    reaper: &mut dyn LibraryReaper,
) -> GcResult<Handle> {
    let capacity = unsafe { m.map_capacity() };
    let bucket_root = heap.push_scratch(new_bucket);
    let source_root = heap.push_scratch(m);
    let new_map = heap.alloc_map(capacity, reaper)?;
    let map_root = heap.push_scratch(new_map);

    for i in 0..capacity {
        let source_map = heap.scratch_get(source_root);
        let bucket = if i == changed_index {
            heap.scratch_get(bucket_root)
        } else {
            unsafe { source_map.map_bucket(i) }
        };
        let dest_map = heap.scratch_get(map_root);
        unsafe { dest_map.map_set_bucket(i, bucket) };
    }
    let dest_map = heap.scratch_get(map_root);
    unsafe { value::init::map(dest_map, new_length, capacity) };

    heap.pop_scratch_to(bucket_root);
    Ok(dest_map)
}

/// Walks `node` looking for `key`; if found, returns a rebuilt bucket
/// with its value replaced by `value`. Returns `None` if `key` is not
/// present (caller keeps the original bucket handle unchanged).
fn replace_in_bucket(
    heap: &mut Heap,
    node: Handle,
    key: Handle,
    value: Handle,
    reaper: &mut dyn LibraryReaper,
) -> GcResult<Option<Handle>> {
    if node.is_null() {
        return Ok(None);
    }
    let existing_key = unsafe { node.list_head() };
    let value_node = unsafe { node.list_tail() };
    let existing_val = unsafe { value_node.list_head() };
    let rest_pairs = unsafe { value_node.list_tail() };

    if unsafe { value::equals(existing_key, key) } {
        let key_root = heap.push_scratch(existing_key);
        let new_value_node = list::cons(heap, value, rest_pairs, reaper)?;
        let existing_key = heap.scratch_get(key_root);
        let new_node = list::cons(heap, existing_key, new_value_node, reaper)?;
        heap.pop_scratch_to(key_root);
        return Ok(Some(new_node));
    }

    let key_root = heap.push_scratch(existing_key);
    let val_root = heap.push_scratch(existing_val);
    let rest = match replace_in_bucket(heap, rest_pairs, key, value, reaper)? {
        None => {
            heap.pop_scratch_to(key_root);
            return Ok(None);
        }
        Some(new_rest) => new_rest,
    };
    let existing_key = heap.scratch_get(key_root);
    let existing_val = heap.scratch_get(val_root);
    let new_value_node = list::cons(heap, existing_val, rest, reaper)?;
    let new_node = list::cons(heap, existing_key, new_value_node, reaper)?;
    heap.pop_scratch_to(key_root);
    Ok(Some(new_node))
}

/// Walks `node` looking for `key`; if found, returns the bucket with
/// that pair spliced out (may be `Handle::NULL`). Returns `None` if
/// `key` is absent.
fn remove_from_bucket(
    heap: &mut Heap,
    node: Handle,
    key: Handle,
    reaper: &mut dyn LibraryReaper,
) -> GcResult<Option<Handle>> {
    if node.is_null() {
        return Ok(None);
    }
    let existing_key = unsafe { node.list_head() };
    let value_node = unsafe { node.list_tail() };
    let existing_val = unsafe { value_node.list_head() };
    let rest_pairs = unsafe { value_node.list_tail() };

    if unsafe { value::equals(existing_key, key) } {
        return Ok(Some(rest_pairs));
    }

    let key_root = heap.push_scratch(existing_key);
    let val_root = heap.push_scratch(existing_val);
    let rest = match remove_from_bucket(heap, rest_pairs, key, reaper)? {
        None => {
            heap.pop_scratch_to(key_root);
            return Ok(None);
        }
        Some(new_rest) => new_rest,
    };
    let existing_key = heap.scratch_get(key_root);
    let existing_val = heap.scratch_get(val_root);
    let new_value_node = list::cons(heap, existing_val, rest, reaper)?;
    let new_node = list::cons(heap, existing_key, new_value_node, reaper)?;
    heap.pop_scratch_to(key_root);
    Ok(Some(new_node))
}

/// Rebuilds every bucket of `m` into a map with `new_capacity` buckets.
fn rehash(heap: &mut Heap, m: Handle, new_capacity: u64, reaper: &mut dyn LibraryReaper) -> GcResult<Handle> {
    let old_capacity = unsafe { m.map_capacity() };
    let length = unsafe { m.map_length() };
    let old_root = heap.push_scratch(m);
    let new_map = heap.alloc_map(new_capacity, reaper)?;
    let new_root = heap.push_scratch(new_map);

    for i in 0..old_capacity {
        let source = heap.scratch_get(old_root);
        let mut cur = unsafe { source.map_bucket(i) };
        while !cur.is_null() {
            let key = unsafe { cur.list_head() };
            let value_node = unsafe { cur.list_tail() };
            let value = unsafe { value_node.list_head() };
            let next = unsafe { value_node.list_tail() };

            let key_root = heap.push_scratch(key);
            let val_root = heap.push_scratch(value);
            let next_root = heap.push_scratch(next);
            let idx = bucket_index(unsafe { value::hash(key) }, new_capacity);
            let dest = heap.scratch_get(new_root);
            let existing_bucket = unsafe { dest.map_bucket(idx) };
            let key_v = heap.scratch_get(key_root);
            let val_v = heap.scratch_get(val_root);
            let value_list = list::cons(heap, val_v, existing_bucket, reaper)?;
            let new_bucket = list::cons(heap, key_v, value_list, reaper)?;
            let dest = heap.scratch_get(new_root);
            unsafe { dest.map_set_bucket(idx, new_bucket) };

            cur = heap.scratch_get(next_root);
            heap.pop_scratch_to(key_root);
        }
    }
    let dest = heap.scratch_get(new_root);
    unsafe { value::init::map(dest, length, new_capacity) };
    heap.pop_scratch_to(old_root);
    Ok(dest)
}

/// Inserts or replaces `key -> value`. Rehashes (doubling capacity)
/// once the load factor would exceed 3/4.
pub fn put(
    heap: &mut Heap,
    m: Handle,
    key: Handle,
    value: Handle,
    reaper: &mut dyn LibraryReaper,
) -> GcResult<Handle> {
    let capacity = unsafe { m.map_capacity() };
    let idx = bucket_index(unsafe { value::hash(key) }, capacity);
    let bucket = unsafe { m.map_bucket(idx) };

    let m_root = heap.push_scratch(m);
    let key_root = heap.push_scratch(key);
    let val_root = heap.push_scratch(value);

    let k = heap.scratch_get(key_root);
    let v = heap.scratch_get(val_root);
    let replaced = replace_in_bucket(heap, bucket, k, v, reaper)?;
    let m = heap.scratch_get(m_root);

    let result = match replaced {
        Some(new_bucket) => {
            let length = unsafe { m.map_length() };
            clone_with_bucket(heap, m, idx, new_bucket, length, reaper)?
        }
        None => {
            let key_v = heap.scratch_get(key_root);
            let val_v = heap.scratch_get(val_root);
            let value_list = list::cons(heap, val_v, bucket, reaper)?;
            let new_bucket = list::cons(heap, key_v, value_list, reaper)?;
            let m = heap.scratch_get(m_root);
            let new_length = unsafe { m.map_length() } + 1;
            let grown = clone_with_bucket(heap, m, idx, new_bucket, new_length, reaper)?;
            if new_length * LOAD_FACTOR_DEN > capacity * LOAD_FACTOR_NUM {
                rehash(heap, grown, capacity * 2, reaper)?
            } else {
                grown
            }
        }
    };
    heap.pop_scratch_to(m_root);
    Ok(result)
}

/// Removes `key` if present; returns `m` unchanged (same handle) if not.
pub fn delete(heap: &mut Heap, m: Handle, key: Handle, reaper: &mut dyn LibraryReaper) -> GcResult<Handle> {
    let capacity = unsafe { m.map_capacity() };
    let idx = bucket_index(unsafe { value::hash(key) }, capacity);
    let bucket = unsafe { m.map_bucket(idx) };

    let m_root = heap.push_scratch(m);
    match remove_from_bucket(heap, bucket, key, reaper)? {
        None => {
            heap.pop_scratch_to(m_root);
            Ok(m)
        }
        Some(new_bucket) => {
            let m = heap.scratch_get(m_root);
            let length = unsafe { m.map_length() } - 1;
            let result = clone_with_bucket(heap, m, idx, new_bucket, length, reaper)?;
            heap.pop_scratch_to(m_root);
            Ok(result)
        }
    }
}

/// Returns the value bound to `key`, or `default` if absent.
///
/// # Safety
/// `m` must be a live Map handle.
pub unsafe fn get_or_else(m: Handle, key: Handle, default: Handle) -> Handle {
    let capacity = unsafe { m.map_capacity() };
    let idx = bucket_index(unsafe { value::hash(key) }, capacity);
    let mut cur = unsafe { m.map_bucket(idx) };
    while !cur.is_null() {
        let k = unsafe { cur.list_head() };
        let value_node = unsafe { cur.list_tail() };
        if unsafe { value::equals(k, key) } {
            return unsafe { value_node.list_head() };
        }
        cur = unsafe { value_node.list_tail() };
    }
    default
}

/// Folds `b`'s bindings into `a`; `b` wins on collisions.
pub fn merge(heap: &mut Heap, a: Handle, b: Handle, reaper: &mut dyn LibraryReaper) -> GcResult<Handle> {
    let a_root = heap.push_scratch(a);
    let b_root = heap.push_scratch(b);
    let capacity = unsafe { heap.scratch_get(b_root).map_capacity() };

    for i in 0..capacity {
        let mut cur = unsafe { heap.scratch_get(b_root).map_bucket(i) };
        while !cur.is_null() {
            let key = unsafe { cur.list_head() };
            let value_node = unsafe { cur.list_tail() };
            let value = unsafe { value_node.list_head() };
            let next = unsafe { value_node.list_tail() };

            let key_root = heap.push_scratch(key);
            let val_root = heap.push_scratch(value);
            let next_root = heap.push_scratch(next);

            let a_now = heap.scratch_get(a_root);
            let key_now = heap.scratch_get(key_root);
            let val_now = heap.scratch_get(val_root);
            let merged = put(heap, a_now, key_now, val_now, reaper)?;
            heap.set_scratch(a_root, merged);

            cur = heap.scratch_get(next_root);
            heap.pop_scratch_to(key_root);
        }
    }
    let result = heap.scratch_get(a_root);
    heap.pop_scratch_to(a_root);
    Ok(result)
}

/// True iff every binding in `sub` also appears (with an equal value)
/// in `sup`.
///
/// # Safety
/// Both handles must be live Map handles.
pub unsafe fn subset_of(sup: Handle, sub: Handle) -> bool {
    let capacity = unsafe { sub.map_capacity() };
    let sentinel = Handle::NULL;
    for i in 0..capacity {
        let mut cur = unsafe { sub.map_bucket(i) };
        while !cur.is_null() {
            let key = unsafe { cur.list_head() };
            let value_node = unsafe { cur.list_tail() };
            let value = unsafe { value_node.list_head() };
            let found = unsafe { get_or_else(sup, key, sentinel) };
            if found.is_null() && !unsafe { sup_has_null_binding(sup, key) } {
                return false;
            }
            if !unsafe { value::equals(found, value) } {
                return false;
            }
            cur = unsafe { value_node.list_tail() };
        }
    }
    true
}

unsafe fn sup_has_null_binding(sup: Handle, key: Handle) -> bool {
    let capacity = unsafe { sup.map_capacity() };
    let idx = bucket_index(unsafe { value::hash(key) }, capacity);
    let mut cur = unsafe { sup.map_bucket(idx) };
    while !cur.is_null() {
        let k = unsafe { cur.list_head() };
        if unsafe { value::equals(k, key) } {
            return true;
        }
        cur = unsafe { cur.list_tail().list_tail() };
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::NoopReaper;

    fn sym(heap: &mut Heap, s: &str) -> Handle {
        heap.alloc_symbol(s).unwrap()
    }
    fn num(heap: &mut Heap, v: f64) -> Handle {
        heap.alloc_number(v).unwrap()
    }

    #[test]
    fn put_then_get() {
        let mut heap = Heap::new(8192);
        let mut reaper = NoopReaper;
        let m = empty(&mut heap, &mut reaper).unwrap();
        let k = sym(&mut heap, "x");
        let v = num(&mut heap, 1.0);
        let sentinel = sym(&mut heap, "__absent__");
        let m2 = put(&mut heap, m, k, v, &mut reaper).unwrap();
        let found = unsafe { get_or_else(m2, k, sentinel) };
        assert!(unsafe { value::equals(found, v) });
        assert_eq!(unsafe { length(m2) }, 1);
    }

    #[test]
    fn delete_then_default() {
        let mut heap = Heap::new(8192);
        let mut reaper = NoopReaper;
        let m = empty(&mut heap, &mut reaper).unwrap();
        let k = sym(&mut heap, "x");
        let v = num(&mut heap, 1.0);
        let sentinel = sym(&mut heap, "__absent__");
        let m2 = put(&mut heap, m, k, v, &mut reaper).unwrap();
        let m3 = delete(&mut heap, m2, k, &mut reaper).unwrap();
        let found = unsafe { get_or_else(m3, k, sentinel) };
        assert!(unsafe { value::equals(found, sentinel) });
        assert_eq!(unsafe { length(m3) }, 0);
    }

    #[test]
    fn merge_precedence() {
        let mut heap = Heap::new(8192);
        let mut reaper = NoopReaper;
        let a = empty(&mut heap, &mut reaper).unwrap();
        let x = sym(&mut heap, "x");
        let y = sym(&mut heap, "y");
        let z = sym(&mut heap, "z");
        let one = num(&mut heap, 1.0);
        let two = num(&mut heap, 2.0);
        let three = num(&mut heap, 3.0);
        let four = num(&mut heap, 4.0);

        let a = put(&mut heap, a, x, one, &mut reaper).unwrap();
        let a = put(&mut heap, a, y, two, &mut reaper).unwrap();

        let b = empty(&mut heap, &mut reaper).unwrap();
        let b = put(&mut heap, b, y, three, &mut reaper).unwrap();
        let b = put(&mut heap, b, z, four, &mut reaper).unwrap();

        let merged = merge(&mut heap, a, b, &mut reaper).unwrap();
        assert_eq!(unsafe { length(merged) }, 3);
        let sentinel = Handle::NULL;
        assert!(unsafe { value::equals(get_or_else(merged, y, sentinel), three) });
        assert!(unsafe { value::equals(get_or_else(merged, x, sentinel), one) });
        assert!(unsafe { value::equals(get_or_else(merged, z, sentinel), four) });
    }

    #[test]
    fn put_does_not_mutate_input() {
        let mut heap = Heap::new(8192);
        let mut reaper = NoopReaper;
        let m = empty(&mut heap, &mut reaper).unwrap();
        let k = sym(&mut heap, "x");
        let v = num(&mut heap, 1.0);
        let before = unsafe { m.map_length() };
        let _ = put(&mut heap, m, k, v, &mut reaper).unwrap();
        assert_eq!(unsafe { m.map_length() }, before);
    }

    #[test]
    fn rehash_on_load_factor() {
        let mut heap = Heap::new(1 << 20);
        let mut reaper = NoopReaper;
        let mut m = empty(&mut heap, &mut reaper).unwrap();
        let initial_capacity = unsafe { m.map_capacity() };
        for i in 0..(initial_capacity * 2) {
            let k = sym(&mut heap, &format!("k{i}"));
            let v = num(&mut heap, i as f64);
            m = put(&mut heap, m, k, v, &mut reaper).unwrap();
        }
        assert!(unsafe { m.map_capacity() } > initial_capacity);
        assert_eq!(unsafe { m.map_length() }, initial_capacity * 2);
    }
}
