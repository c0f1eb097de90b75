//! Stack frames: the collector's root set.
//!
//! Each frame carries three scratch registers plus three indirect
//! slots — dictionary, callstack, datastack — that alias a slot owned
//! by an enclosing scope, so a callee's push is visible to its caller
//! without the caller re-reading anything. The aliasing is expressed
//! here as a borrowed, lifetime-tied mutable reference rather than a
//! raw untyped pointer: `&'a mut Handle` gives the exact "write through
//! to the enclosing scope's slot" behavior the algorithm needs while
//! keeping the aliasing checked by the borrow checker.
//!
//! A frame chain is walked front-to-back by [`Frame::for_each_root`]
//! whenever the owning evaluator asks the heap to collect.

use crate::value::Handle;

/// One stack frame. `'a` ties the indirect slots to the scope that
/// owns the values they point into — typically the previous frame in
/// the chain, or the evaluator's top-level environment.
pub struct Frame<'a> {
    previous: Option<&'a mut Frame<'a>>,
    registers: [Handle; 3],
    dictionary: &'a mut Handle,
    callstack: &'a mut Handle,
    datastack: &'a mut Handle,
}

impl<'a> Frame<'a> {
    /// Inherits the caller's indirect slots; registers start null.
    pub fn inherit(
        previous: Option<&'a mut Frame<'a>>,
        dictionary: &'a mut Handle,
        callstack: &'a mut Handle,
        datastack: &'a mut Handle,
    ) -> Frame<'a> {
        Frame {
            previous,
            registers: [Handle::NULL; 3],
            dictionary,
            callstack,
            datastack,
        }
    }

    /// A frame with no dictionary/callstack/datastack context of its
    /// own (used where those do not yet exist, e.g. module bootstrap).
    pub fn empty(
        previous: Option<&'a mut Frame<'a>>,
        dictionary: &'a mut Handle,
        callstack: &'a mut Handle,
        datastack: &'a mut Handle,
    ) -> Frame<'a> {
        *dictionary = Handle::NULL;
        *callstack = Handle::NULL;
        *datastack = Handle::NULL;
        Frame {
            previous,
            registers: [Handle::NULL; 3],
            dictionary,
            callstack,
            datastack,
        }
    }

    pub fn register(&self, index: usize) -> Handle {
        self.registers[index]
    }

    pub fn set_register(&mut self, index: usize, value: Handle) {
        self.registers[index] = value;
    }

    pub fn dictionary(&self) -> Handle {
        *self.dictionary
    }

    pub fn set_dictionary(&mut self, value: Handle) {
        *self.dictionary = value;
    }

    pub fn callstack(&self) -> Handle {
        *self.callstack
    }

    pub fn set_callstack(&mut self, value: Handle) {
        *self.callstack = value;
    }

    pub fn datastack(&self) -> Handle {
        *self.datastack
    }

    pub fn set_datastack(&mut self, value: Handle) {
        *self.datastack = value;
    }

    /// Applies `visit` to every handle this frame (and its ancestors)
    /// roots: the three registers and the three indirect slots. This is
    /// the closure a [`crate::heap::Heap::collect`] call is given.
    pub fn for_each_root(&mut self, visit: &mut dyn FnMut(&mut Handle)) {
        for r in &mut self.registers {
            visit(r);
        }
        visit(self.dictionary);
        visit(self.callstack);
        visit(self.datastack);
        if let Some(prev) = self.previous.as_deref_mut() {
            prev.for_each_root(visit);
        }
    }
}

/// A `repr(C)` mirror of a frame's fields, carrying no lifetime. This
/// is what actually crosses the native function ABI boundary: a
/// `Frame<'a>` cannot be named in an `extern "C" fn` pointer type (its
/// borrows are checked, not FFI-safe), so a dynamically loaded module
/// receives a `*mut RawFrame` instead and reads through raw pointers.
/// In-process callers stay on [`Frame`] throughout; only
/// `bowl-runtime`'s module loader constructs one of these, immediately
/// before a call across the dlopen boundary.
#[repr(C)]
pub struct RawFrame {
    pub previous: *mut RawFrame,
    pub registers: [Handle; 3],
    pub dictionary: *mut Handle,
    pub callstack: *mut Handle,
    pub datastack: *mut Handle,
}

impl<'a> Frame<'a> {
    /// Builds the raw view of this frame. The returned pointers borrow
    /// from `self` and from whatever `self` itself borrows; the caller
    /// must not let the `RawFrame` outlive this frame.
    pub fn as_raw(&mut self) -> RawFrame {
        RawFrame {
            previous: std::ptr::null_mut(),
            registers: self.registers,
            dictionary: self.dictionary as *mut Handle,
            callstack: self.callstack as *mut Handle,
            datastack: self.datastack as *mut Handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, NoopReaper};

    #[test]
    fn inherited_frame_shares_indirect_slots() {
        let mut dictionary = Handle::NULL;
        let mut callstack = Handle::NULL;
        let mut datastack = Handle::NULL;
        let mut heap = Heap::new(4096);
        let s = heap.alloc_string("hi").unwrap();

        let mut outer = Frame::inherit(None, &mut dictionary, &mut callstack, &mut datastack);
        outer.set_datastack(s);
        {
            let mut inner_dict = outer.dictionary();
            let mut inner_call = outer.callstack();
            let mut inner_data = outer.datastack();
            let mut inner = Frame::inherit(None, &mut inner_dict, &mut inner_call, &mut inner_data);
            // The callee observes the caller's current datastack value.
            assert_eq!(unsafe { inner.datastack().as_str() }, "hi");
            inner.set_register(0, inner.datastack());
            assert_eq!(unsafe { inner.register(0).as_str() }, "hi");
        }
    }

    #[test]
    fn frame_chain_roots_survive_collection() {
        let mut heap = Heap::new(256);
        let mut reaper = NoopReaper;
        let mut dictionary = Handle::NULL;
        let mut callstack = Handle::NULL;
        let mut datastack = heap.alloc_string("rooted").unwrap();

        let mut frame = Frame::inherit(None, &mut dictionary, &mut callstack, &mut datastack);
        frame.set_register(0, frame.datastack());

        let mut roots = |apply: &mut dyn FnMut(&mut Handle)| frame.for_each_root(apply);
        heap.collect(&mut roots, &mut reaper);

        assert_eq!(unsafe { datastack.as_str() }, "rooted");
    }
}
