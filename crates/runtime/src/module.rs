//! Dynamic module loader.
//!
//! A module is a shared object exporting `module_initialize` and
//! `module_finalize`, each `(stack-frame-pointer) -> exception-or-null`.
//! Loading resolves the object, wraps its handle in a Library value,
//! and calls `module_initialize`; unloading happens indirectly, through
//! the collector, when the Library value becomes unreachable — see
//! [`ModuleRegistry`]'s [`LibraryReaper`] implementation.
//!
//! The platform primitive is reached behind [`DynamicLibrary`] rather
//! than hand-rolled: on Unix this is the `libc` crate's `dlopen` family,
//! matching the original's own `dlfcn.h` usage.

use std::collections::HashMap;
use std::ffi::{c_void, CString};

use bowl_core::frame::RawFrame;
use bowl_core::heap::{Heap, LibraryReaper};
use bowl_core::sentinel::Sentinels;
use bowl_core::map;
use bowl_core::value::{Handle, NativeFn};

use crate::error;

#[cfg(unix)]
mod platform {
    use std::ffi::{c_void, CString};

    pub unsafe fn open(path: &CString) -> *mut c_void {
        unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) }
    }

    pub unsafe fn symbol(handle: *mut c_void, name: &CString) -> *mut c_void {
        unsafe { libc::dlsym(handle, name.as_ptr()) }
    }

    pub unsafe fn close(handle: *mut c_void) {
        unsafe {
            libc::dlclose(handle);
        }
    }
}

/// Thin wrapper over the platform's dynamic-loading primitives.
pub struct DynamicLibrary;

impl DynamicLibrary {
    /// # Safety
    /// `path` must name a file the platform loader can map as a shared
    /// object; the caller is trusting its exported symbols.
    pub unsafe fn open(path: &str) -> Option<*mut c_void> {
        let c_path = CString::new(path).ok()?;
        let handle = unsafe { platform::open(&c_path) };
        if handle.is_null() {
            None
        } else {
            Some(handle)
        }
    }

    /// # Safety
    /// `handle` must be a live handle from [`DynamicLibrary::open`].
    pub unsafe fn symbol(handle: *mut c_void, name: &str) -> Option<NativeFn> {
        let c_name = CString::new(name).ok()?;
        let sym = unsafe { platform::symbol(handle, &c_name) };
        if sym.is_null() {
            None
        } else {
            Some(unsafe { std::mem::transmute::<*mut c_void, NativeFn>(sym) })
        }
    }

    /// # Safety
    /// `handle` must be a live handle from [`DynamicLibrary::open`] not
    /// already closed.
    pub unsafe fn close(handle: *mut c_void) {
        unsafe { platform::close(handle) };
    }
}

/// Tracks loaded modules by path, for [`ModuleRegistry::is_loaded`] and
/// [`ModuleRegistry::load`]'s dedup check. Doubles as the
/// [`LibraryReaper`] the collector calls into when a Library value
/// dies; `finalize_dead` reads the path back out of the dying value
/// itself rather than needing a reverse index.
pub struct ModuleRegistry {
    loaded: HashMap<String, Handle>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry {
            loaded: HashMap::new(),
        }
    }

    pub fn is_loaded(&self, path: &str) -> bool {
        self.loaded.contains_key(path)
    }

    /// Loads `path`, calls `module_initialize`, and returns its Library
    /// value. Rolls back (closes the handle, does not register it) if
    /// the object can't be opened, initialize is missing, or it raises.
    pub fn load(
        &mut self,
        heap: &mut Heap,
        sentinels: &Sentinels,
        datastack: &mut Handle,
        path: &str,
    ) -> Result<Handle, Handle> {
        if let Some(&existing) = self.loaded.get(path) {
            return Ok(existing);
        }

        let raw = match unsafe { DynamicLibrary::open(path) } {
            Some(raw) => raw,
            None => {
                return Err(error::format_exception(
                    heap,
                    self,
                    sentinels.out_of_heap,
                    &format!("failed to load module {path}"),
                )?);
            }
        };

        let library = heap
            .alloc_library(raw, path, self)
            .map_err(|_| sentinels.out_of_heap)?;
        // Rooted on the heap's own scratch stack, not just this raw
        // pointer, so a collection triggered from inside `init` (which
        // only sees `raw_frame`'s slots as roots) can't reclaim it.
        let library_root = heap.push_scratch(library);

        let init = match unsafe { DynamicLibrary::symbol(raw, "module_initialize") } {
            Some(f) => f,
            None => {
                heap.pop_scratch_to(library_root);
                unsafe { DynamicLibrary::close(raw) };
                return Err(error::format_exception(
                    heap,
                    self,
                    sentinels.out_of_heap,
                    &format!("{path}: missing module_initialize"),
                )?);
            }
        };

        let mut dictionary = Handle::NULL;
        let mut callstack = Handle::NULL;
        let mut raw_frame = RawFrame {
            previous: std::ptr::null_mut(),
            registers: [Handle::NULL; 3],
            dictionary: &mut dictionary,
            callstack: &mut callstack,
            datastack,
        };
        let outcome = unsafe { init(&mut raw_frame) };
        let library = heap.scratch_get(library_root);
        heap.pop_scratch_to(library_root);

        if !outcome.is_null() {
            unsafe { DynamicLibrary::close(raw) };
            return Err(outcome);
        }

        self.loaded.insert(path.to_string(), library);
        Ok(library)
    }

    /// Inserts `(name, function)` into `dictionary` as a Function value
    /// bound to `library`. Collisions overwrite silently (the same
    /// `map::put` precedence every other binding uses).
    pub fn register(
        &mut self,
        heap: &mut Heap,
        sentinels: &Sentinels,
        mut library: Handle,
        dictionary: Handle,
        name: &str,
        function: NativeFn,
    ) -> Result<Handle, Handle> {
        let function_h = heap
            .alloc_function(&mut library, function, self)
            .map_err(|_| sentinels.out_of_heap)?;
        let key = heap.alloc_symbol(name).map_err(|_| sentinels.out_of_heap)?;
        map::put(heap, dictionary, key, function_h, self).map_err(|_| sentinels.out_of_heap)
    }

    /// [`ModuleRegistry::register`] for a whole table of entries at once.
    pub fn register_all(
        &mut self,
        heap: &mut Heap,
        sentinels: &Sentinels,
        library: Handle,
        mut dictionary: Handle,
        entries: &[(&str, NativeFn)],
    ) -> Result<Handle, Handle> {
        for &(name, function) in entries {
            dictionary = self.register(heap, sentinels, library, dictionary, name, function)?;
        }
        Ok(dictionary)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryReaper for ModuleRegistry {
    /// Called by [`Heap::collect`] when a Library value is unreachable.
    /// Resolves and calls `module_finalize` while the handle is still
    /// open, then closes it. The dying value's bytes are still intact
    /// at this point (collection hasn't swapped semispaces yet), so
    /// reading its name/handle here is sound.
    fn finalize_dead(&mut self, library: Handle) -> Result<(), ()> {
        let name = unsafe { library.library_name() };
        let raw = unsafe { library.library_handle() };
        self.loaded.remove(name);

        let finalize = unsafe { DynamicLibrary::symbol(raw, "module_finalize") };
        let result = match finalize {
            Some(f) => {
                let mut dictionary = Handle::NULL;
                let mut callstack = Handle::NULL;
                let mut datastack = Handle::NULL;
                let mut raw_frame = RawFrame {
                    previous: std::ptr::null_mut(),
                    registers: [Handle::NULL; 3],
                    dictionary: &mut dictionary,
                    callstack: &mut callstack,
                    datastack: &mut datastack,
                };
                let outcome = unsafe { f(&mut raw_frame) };
                if outcome.is_null() { Ok(()) } else { Err(()) }
            }
            None => Ok(()),
        };

        unsafe { DynamicLibrary::close(raw) };
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_loaded_before_any_load_call() {
        let registry = ModuleRegistry::new();
        assert!(!registry.is_loaded("/nonexistent/module.so"));
    }

    #[test]
    fn load_of_missing_file_is_an_exception() {
        let mut heap = Heap::new(8192);
        let sentinels = Sentinels::install(&mut heap);
        let mut registry = ModuleRegistry::new();
        let mut datastack = Handle::NULL;
        let result = registry.load(&mut heap, &sentinels, &mut datastack, "/nonexistent/module.so");
        assert!(result.is_err());
        assert!(!registry.is_loaded("/nonexistent/module.so"));
    }
}
