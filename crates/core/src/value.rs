//! The tagged heap value.
//!
//! Every value lives in a single contiguous allocation: a fixed
//! [`Header`], a variant-specific fixed body, and (for variable-length
//! variants) a trailing run of bytes or handles. A [`Handle`] is just a
//! pointer to the header; the null handle is the canonical empty list
//! and nothing else.
//!
//! Field access below is unsafe pointer arithmetic on purpose: this
//! mirrors the single-allocation layout the collector depends on
//! (moving a value means `memcpy`-ing exactly `byte_size(v)` bytes).
//! Nothing here is `Send`/`Sync`; a heap belongs to one mutator.

use std::fmt;
use std::os::raw::c_void;

/// Discriminant for the ten value variants.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tag {
    Symbol = 0,
    String = 1,
    Number = 2,
    Boolean = 3,
    List = 4,
    Vector = 5,
    Map = 6,
    Function = 7,
    Library = 8,
    Exception = 9,
}

/// Header shared by every value. `forwarding` is `Handle::NULL` outside
/// of a collection cycle; the collector sets it to the to-space copy
/// while evacuating. `hash` caches [`crate::value::hash`]; `0` means
/// "not yet computed" (see the open question in the design notes about
/// whether a real hash of 0 can occur — it can, and is folded to 1).
#[repr(C)]
pub struct Header {
    pub tag: Tag,
    pub forwarding: Handle,
    pub hash: u64,
}

/// A pointer to a value's header. `NULL` denotes the empty list and
/// (depending on call site convention) an absent dictionary binding;
/// see `DESIGN.md` for the audit of which is meant where.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) *mut Header);

impl Handle {
    pub const NULL: Handle = Handle(std::ptr::null_mut());

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// # Safety
    /// `self` must be null or point at a live, fully initialized header
    /// within a heap this process owns.
    pub unsafe fn tag(self) -> Tag {
        debug_assert!(!self.is_null(), "tag() called on the null handle");
        unsafe { (*self.0).tag }
    }

    pub(crate) unsafe fn header(self) -> &'static Header {
        unsafe { &*self.0 }
    }

    pub(crate) unsafe fn header_mut(self) -> &'static mut Header {
        unsafe { &mut *self.0 }
    }

    pub(crate) fn as_ptr(self) -> *mut Header {
        self.0
    }

    pub(crate) unsafe fn from_ptr(ptr: *mut Header) -> Handle {
        Handle(ptr)
    }

    /// Byte offset from the header to the start of the variant body.
    pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<Header>();

    unsafe fn body<T>(self) -> *mut T {
        unsafe { (self.0 as *mut u8).add(Self::HEADER_SIZE) as *mut T }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Handle(null)")
        } else {
            write!(f, "Handle({:?} @ {:p})", unsafe { self.tag() }, self.0)
        }
    }
}

// Fixed bodies, one per variant. Variable-length payloads follow
// immediately after the body in the same allocation.

#[repr(C)]
pub(crate) struct SymbolBody {
    pub length: u64,
}
#[repr(C)]
pub(crate) struct StringBody {
    pub length: u64,
}
#[repr(C)]
pub(crate) struct NumberBody {
    pub value: f64,
}
#[repr(C)]
pub(crate) struct BooleanBody {
    pub value: u8,
}
#[repr(C)]
pub(crate) struct ListBody {
    pub length: u64,
    pub head: Handle,
    pub tail: Handle,
}
#[repr(C)]
pub(crate) struct VectorBody {
    pub length: u64,
}
#[repr(C)]
pub(crate) struct MapBody {
    pub length: u64,
    pub capacity: u64,
}

/// `(frame) -> exception-or-null`. See `bowl-runtime`'s ABI module for
/// the calling convention this is embedded in.
pub type NativeFn = unsafe extern "C" fn(*mut crate::frame::RawFrame) -> Handle;

#[repr(C)]
pub(crate) struct FunctionBody {
    pub library: Handle,
    pub function: NativeFn,
}
#[repr(C)]
pub(crate) struct LibraryBody {
    pub handle: *mut c_void,
    pub length: u64,
}
#[repr(C)]
pub(crate) struct ExceptionBody {
    pub cause: Handle,
    pub message: Handle,
}

/// Total allocation size (header + body + trailing bytes), rounded up
/// to 8-byte alignment. `extra` is the trailing byte count: symbol/
/// string byte length, `capacity * size_of::<Handle>()` for a map,
/// `length * size_of::<Handle>()` for a vector, library name length.
pub(crate) fn allocation_size(body_size: usize, extra: usize) -> usize {
    let raw = Handle::HEADER_SIZE + body_size + extra;
    (raw + 7) & !7
}

impl Handle {
    // ---- Symbol / String --------------------------------------------

    unsafe fn text_body(self) -> (*mut u64, *mut u8) {
        let length_ptr: *mut u64 = unsafe { self.body() };
        let bytes_ptr = unsafe { (length_ptr as *mut u8).add(std::mem::size_of::<u64>()) };
        (length_ptr, bytes_ptr)
    }

    /// # Safety
    /// `self` must be a live Symbol or String handle.
    pub unsafe fn as_str(self) -> &'static str {
        unsafe {
            let (length_ptr, bytes_ptr) = self.text_body();
            let len = *length_ptr as usize;
            let slice = std::slice::from_raw_parts(bytes_ptr, len);
            std::str::from_utf8_unchecked(slice)
        }
    }

    unsafe fn init_text(self, s: &str) {
        unsafe {
            let (length_ptr, bytes_ptr) = self.text_body();
            *length_ptr = s.len() as u64;
            std::ptr::copy_nonoverlapping(s.as_ptr(), bytes_ptr, s.len());
        }
    }

    // ---- Number / Boolean ---------------------------------------------

    /// # Safety: `self` must be a live Number handle.
    pub unsafe fn as_number(self) -> f64 {
        unsafe { (*self.body::<NumberBody>()).value }
    }

    unsafe fn init_number(self, value: f64) {
        unsafe { (*self.body::<NumberBody>()).value = value }
    }

    /// # Safety: `self` must be a live Boolean handle.
    pub unsafe fn as_bool(self) -> bool {
        unsafe { (*self.body::<BooleanBody>()).value != 0 }
    }

    unsafe fn init_bool(self, value: bool) {
        unsafe { (*self.body::<BooleanBody>()).value = value as u8 }
    }

    // ---- List -----------------------------------------------------------

    /// # Safety: `self` must be a live List handle or null.
    pub unsafe fn list_length(self) -> u64 {
        if self.is_null() {
            0
        } else {
            unsafe { (*self.body::<ListBody>()).length }
        }
    }

    /// # Safety: `self` must be a live List handle (non-null).
    pub unsafe fn list_head(self) -> Handle {
        unsafe { (*self.body::<ListBody>()).head }
    }

    /// # Safety: `self` must be a live List handle (non-null).
    pub unsafe fn list_tail(self) -> Handle {
        unsafe { (*self.body::<ListBody>()).tail }
    }

    unsafe fn init_list(self, head: Handle, tail: Handle) {
        unsafe {
            let tail_len = if tail.is_null() { 0 } else { tail.list_length() };
            let body = self.body::<ListBody>();
            (*body).length = tail_len + 1;
            (*body).head = head;
            (*body).tail = tail;
        }
    }

    /// # Safety: `self` must be a live List handle; used only by the collector.
    pub(crate) unsafe fn set_list_fields(self, head: Handle, tail: Handle) {
        unsafe {
            let body = self.body::<ListBody>();
            (*body).head = head;
            (*body).tail = tail;
        }
    }

    // ---- Vector -------------------------------------------------------

    unsafe fn vector_elements_ptr(self) -> *mut Handle {
        unsafe { (self.body::<VectorBody>() as *mut u8).add(std::mem::size_of::<VectorBody>()) as *mut Handle }
    }

    /// # Safety: `self` must be a live Vector handle.
    pub unsafe fn vector_length(self) -> u64 {
        unsafe { (*self.body::<VectorBody>()).length }
    }

    /// # Safety: `self` must be a live Vector handle; `index < length`.
    pub unsafe fn vector_get(self, index: u64) -> Handle {
        unsafe { *self.vector_elements_ptr().add(index as usize) }
    }

    /// # Safety: `self` must be a live, still-being-constructed Vector handle.
    pub unsafe fn vector_set(self, index: u64, value: Handle) {
        unsafe { *self.vector_elements_ptr().add(index as usize) = value }
    }

    unsafe fn init_vector(self, length: u64, fill: Handle) {
        unsafe {
            (*self.body::<VectorBody>()).length = length;
            let elements = self.vector_elements_ptr();
            for i in 0..length as usize {
                *elements.add(i) = fill;
            }
        }
    }

    // ---- Map ------------------------------------------------------------

    unsafe fn map_buckets_ptr(self) -> *mut Handle {
        unsafe { (self.body::<MapBody>() as *mut u8).add(std::mem::size_of::<MapBody>()) as *mut Handle }
    }

    /// # Safety: `self` must be a live Map handle.
    pub unsafe fn map_length(self) -> u64 {
        unsafe { (*self.body::<MapBody>()).length }
    }

    /// # Safety: `self` must be a live Map handle.
    pub unsafe fn map_capacity(self) -> u64 {
        unsafe { (*self.body::<MapBody>()).capacity }
    }

    /// # Safety: `self` must be a live Map handle; `index < capacity`.
    pub unsafe fn map_bucket(self, index: u64) -> Handle {
        unsafe { *self.map_buckets_ptr().add(index as usize) }
    }

    /// # Safety: `self` must be a live, still-being-constructed Map handle.
    pub unsafe fn map_set_bucket(self, index: u64, bucket: Handle) {
        unsafe { *self.map_buckets_ptr().add(index as usize) = bucket }
    }

    unsafe fn init_map(self, length: u64, capacity: u64) {
        unsafe {
            let body = self.body::<MapBody>();
            (*body).length = length;
            (*body).capacity = capacity;
            let buckets = self.map_buckets_ptr();
            for i in 0..capacity as usize {
                *buckets.add(i) = Handle::NULL;
            }
        }
    }

    // ---- Function / Library / Exception --------------------------------

    /// # Safety: `self` must be a live Function handle.
    pub unsafe fn function_library(self) -> Handle {
        unsafe { (*self.body::<FunctionBody>()).library }
    }

    /// # Safety: `self` must be a live Function handle.
    pub unsafe fn function_ptr(self) -> NativeFn {
        unsafe { (*self.body::<FunctionBody>()).function }
    }

    unsafe fn init_function(self, library: Handle, function: NativeFn) {
        unsafe {
            let body = self.body::<FunctionBody>();
            (*body).library = library;
            (*body).function = function;
        }
    }

    /// # Safety: `self` must be a live Function handle; used only by the collector.
    pub(crate) unsafe fn set_function_library(self, library: Handle) {
        unsafe { (*self.body::<FunctionBody>()).library = library }
    }

    /// # Safety: `self` must be a live Library handle.
    pub unsafe fn library_handle(self) -> *mut c_void {
        unsafe { (*self.body::<LibraryBody>()).handle }
    }

    /// # Safety: `self` must be a live Library handle.
    pub unsafe fn library_name(self) -> &'static str {
        unsafe {
            let body: *mut LibraryBody = self.body();
            let len = (*body).length as usize;
            let bytes = (body as *mut u8).add(std::mem::size_of::<LibraryBody>());
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(bytes, len))
        }
    }

    unsafe fn init_library(self, handle: *mut c_void, name: &str) {
        unsafe {
            let body: *mut LibraryBody = self.body();
            (*body).handle = handle;
            (*body).length = name.len() as u64;
            let bytes = (body as *mut u8).add(std::mem::size_of::<LibraryBody>());
            std::ptr::copy_nonoverlapping(name.as_ptr(), bytes, name.len());
        }
    }

    /// # Safety: `self` must be a live Exception handle.
    pub unsafe fn exception_cause(self) -> Handle {
        unsafe { (*self.body::<ExceptionBody>()).cause }
    }

    /// # Safety: `self` must be a live Exception handle.
    pub unsafe fn exception_message(self) -> Handle {
        unsafe { (*self.body::<ExceptionBody>()).message }
    }

    unsafe fn init_exception(self, cause: Handle, message: Handle) {
        unsafe {
            let body = self.body::<ExceptionBody>();
            (*body).cause = cause;
            (*body).message = message;
        }
    }

    /// # Safety: `self` must be a live Exception handle; used only by the collector.
    pub(crate) unsafe fn set_exception_fields(self, cause: Handle, message: Handle) {
        unsafe {
            let body = self.body::<ExceptionBody>();
            (*body).cause = cause;
            (*body).message = message;
        }
    }
}

/// The byte size of a value's own allocation (header + body + trailing
/// payload), used by the collector to `memcpy` it whole and by the
/// allocator to size requests.
///
/// # Safety
/// `h` must be null or a live, fully initialized handle.
pub unsafe fn byte_size(h: Handle) -> usize {
    if h.is_null() {
        return allocation_size(std::mem::size_of::<ListBody>(), 0);
    }
    unsafe {
        match h.tag() {
            Tag::Symbol | Tag::String => {
                let len = (*h.body::<SymbolBody>()).length as usize;
                allocation_size(std::mem::size_of::<SymbolBody>(), len)
            }
            Tag::Number => allocation_size(std::mem::size_of::<NumberBody>(), 0),
            Tag::Boolean => allocation_size(std::mem::size_of::<BooleanBody>(), 0),
            Tag::List => allocation_size(std::mem::size_of::<ListBody>(), 0),
            Tag::Vector => {
                let len = h.vector_length() as usize;
                allocation_size(
                    std::mem::size_of::<VectorBody>(),
                    len * std::mem::size_of::<Handle>(),
                )
            }
            Tag::Map => {
                let cap = h.map_capacity() as usize;
                allocation_size(
                    std::mem::size_of::<MapBody>(),
                    cap * std::mem::size_of::<Handle>(),
                )
            }
            Tag::Function => allocation_size(std::mem::size_of::<FunctionBody>(), 0),
            Tag::Library => {
                let len = (*h.body::<LibraryBody>()).length as usize;
                allocation_size(std::mem::size_of::<LibraryBody>(), len)
            }
            Tag::Exception => allocation_size(std::mem::size_of::<ExceptionBody>(), 0),
        }
    }
}

/// Structural equality. Recurses into lists/vectors/maps; everything
/// else compares by value. Two handles to the same object are always
/// equal without recursing.
///
/// # Safety
/// Both handles must be null or live.
pub unsafe fn equals(a: Handle, b: Handle) -> bool {
    if a == b {
        return true;
    }
    if a.is_null() || b.is_null() {
        return false;
    }
    unsafe {
        if a.tag() != b.tag() {
            return false;
        }
        match a.tag() {
            Tag::Symbol | Tag::String => a.as_str() == b.as_str(),
            Tag::Number => a.as_number() == b.as_number(),
            Tag::Boolean => a.as_bool() == b.as_bool(),
            Tag::List => {
                equals(a.list_head(), b.list_head()) && equals(a.list_tail(), b.list_tail())
            }
            Tag::Vector => {
                let n = a.vector_length();
                if n != b.vector_length() {
                    return false;
                }
                (0..n).all(|i| equals(a.vector_get(i), b.vector_get(i)))
            }
            Tag::Map => crate::map::equals(a, b),
            Tag::Function => a.function_ptr() as usize == b.function_ptr() as usize,
            Tag::Library => a.library_handle() == b.library_handle(),
            Tag::Exception => {
                equals(a.exception_cause(), b.exception_cause())
                    && equals(a.exception_message(), b.exception_message())
            }
        }
    }
}

fn mix(h: u64, x: u64) -> u64 {
    // FNV-1a style mixing, 64-bit.
    let mut acc = h ^ x;
    acc = acc.wrapping_mul(0x100000001b3);
    acc
}

/// Deterministic, lazily cached hash. `equals(a, b)` implies `hash(a)
/// == hash(b)`. `0` is reserved to mean "uncomputed"; a real hash of 0
/// is folded to `1` so the cache slot is never ambiguous.
///
/// # Safety
/// `h` must be null or live.
pub unsafe fn hash(h: Handle) -> u64 {
    if h.is_null() {
        return 0x9e3779b97f4a7c15; // fixed hash of the empty list
    }
    unsafe {
        let cached = h.header().hash;
        if cached != 0 {
            return cached;
        }
        let computed = compute_hash(h);
        let computed = if computed == 0 { 1 } else { computed };
        h.header_mut().hash = computed;
        computed
    }
}

unsafe fn compute_hash(h: Handle) -> u64 {
    const BASIS: u64 = 0xcbf29ce484222325;
    unsafe {
        match h.tag() {
            Tag::Symbol | Tag::String => {
                let mut acc = BASIS ^ h.tag() as u64;
                for b in h.as_str().bytes() {
                    acc = mix(acc, b as u64);
                }
                acc
            }
            Tag::Number => mix(BASIS, h.as_number().to_bits()),
            Tag::Boolean => mix(BASIS, h.as_bool() as u64),
            Tag::List => {
                let mut acc = BASIS;
                let mut cur = h;
                while !cur.is_null() {
                    acc = mix(acc, hash(cur.list_head()));
                    cur = cur.list_tail();
                }
                acc
            }
            Tag::Vector => {
                let mut acc = BASIS;
                for i in 0..h.vector_length() {
                    acc = mix(acc, hash(h.vector_get(i)));
                }
                acc
            }
            Tag::Map => {
                // Order-independent: fold with addition, not mix-chain.
                let mut acc: u64 = 0;
                for i in 0..h.map_capacity() {
                    let mut cur = h.map_bucket(i);
                    while !cur.is_null() {
                        let k = cur.list_head();
                        let v = cur.list_tail().list_head();
                        acc = acc.wrapping_add(hash(k) ^ hash(v).rotate_left(17));
                        cur = cur.list_tail().list_tail();
                    }
                }
                acc ^ BASIS
            }
            Tag::Function => mix(BASIS, h.function_ptr() as usize as u64),
            Tag::Library => mix(BASIS, h.library_handle() as usize as u64),
            Tag::Exception => mix(hash(h.exception_message()), hash(h.exception_cause())),
        }
    }
}

/// Fixed-field initializers used right after [`crate::heap::Heap::allocate`].
/// Each must be called exactly once, before any further allocation, per
/// the "uninitialized window" invariant documented on `Heap::allocate`.
pub mod init {
    use super::Handle;
    use std::os::raw::c_void;

    /// # Safety: `h` was just allocated as a Symbol/String of the right size.
    pub unsafe fn text(h: Handle, s: &str) {
        unsafe { h.init_text(s) }
    }
    /// # Safety: `h` was just allocated as a Number.
    pub unsafe fn number(h: Handle, v: f64) {
        unsafe { h.init_number(v) }
    }
    /// # Safety: `h` was just allocated as a Boolean.
    pub unsafe fn boolean(h: Handle, v: bool) {
        unsafe { h.init_bool(v) }
    }
    /// # Safety: `h` was just allocated as a List.
    pub unsafe fn list(h: Handle, head: Handle, tail: Handle) {
        unsafe { h.init_list(head, tail) }
    }
    /// # Safety: `h` was just allocated as a Vector of `length` slots.
    pub unsafe fn vector(h: Handle, length: u64, fill: Handle) {
        unsafe { h.init_vector(length, fill) }
    }
    /// # Safety: `h` was just allocated as a Map with `capacity` buckets.
    pub unsafe fn map(h: Handle, length: u64, capacity: u64) {
        unsafe { h.init_map(length, capacity) }
    }
    /// # Safety: `h` was just allocated as a Function.
    pub unsafe fn function(h: Handle, library: Handle, function: super::NativeFn) {
        unsafe { h.init_function(library, function) }
    }
    /// # Safety: `h` was just allocated as a Library with room for `name`.
    pub unsafe fn library(h: Handle, handle: *mut c_void, name: &str) {
        unsafe { h.init_library(handle, name) }
    }
    /// # Safety: `h` was just allocated as an Exception.
    pub unsafe fn exception(h: Handle, cause: Handle, message: Handle) {
        unsafe { h.init_exception(cause, message) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn header_is_24_bytes() {
        assert_eq!(std::mem::size_of::<Header>(), 24);
    }

    #[test]
    fn null_handle_is_empty_list() {
        let n = Handle::NULL;
        assert!(n.is_null());
        assert_eq!(unsafe { n.list_length() }, 0);
    }

    #[test]
    fn string_round_trips_bytes() {
        let mut heap = Heap::new(4096);
        let h = heap.alloc_string("hello").unwrap();
        assert_eq!(unsafe { h.as_str() }, "hello");
        assert_eq!(unsafe { h.tag() }, Tag::String);
    }

    #[test]
    fn equal_strings_hash_equal() {
        let mut heap = Heap::new(4096);
        let a = heap.alloc_string("x").unwrap();
        let b = heap.alloc_string("x").unwrap();
        assert!(unsafe { equals(a, b) });
        assert_eq!(unsafe { hash(a) }, unsafe { hash(b) });
    }

    #[test]
    fn hash_is_cached() {
        let mut heap = Heap::new(4096);
        let a = heap.alloc_string("cache-me").unwrap();
        let first = unsafe { hash(a) };
        assert_eq!(unsafe { a.header().hash }, first);
        let second = unsafe { hash(a) };
        assert_eq!(first, second);
    }
}
