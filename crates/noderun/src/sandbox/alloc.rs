//! Heap accounting for one QuickJS runtime.
//!
//! The interpreter only reports a refused allocation as an ordinary
//! `InternalError`, which script code can forge. Enforcing the limit here
//! gives the worker a signal that only a real breach can raise.

use std::sync::Arc;

use rquickjs::allocator::{Allocator, RustAllocator};

use super::handle::Guard;

pub struct Budget {
    used: usize,
    limit: usize,
    guard: Arc<Guard>,
}

impl Budget {
    /// A `limit` of zero disables the bound.
    pub const fn new(limit: usize, guard: Arc<Guard>) -> Self {
        Self {
            used: 0,
            limit,
            guard,
        }
    }

    fn admit(&self, size: usize) -> bool {
        if self.limit == 0 {
            return true;
        }
        match self.used.checked_add(size) {
            Some(total) if total <= self.limit => true,
            _ => {
                self.guard.note_memory_exhausted();
                false
            }
        }
    }

    fn track(&mut self, ptr: *mut u8) -> *mut u8 {
        if !ptr.is_null() {
            // SAFETY: `ptr` was just returned by `RustAllocator`.
            self.used += unsafe { RustAllocator::usable_size(ptr) };
        }
        ptr
    }
}

// SAFETY: every call is forwarded to `RustAllocator`, which upholds the
// contract; this type only refuses requests and keeps a running total.
unsafe impl Allocator for Budget {
    fn alloc(&mut self, size: usize) -> *mut u8 {
        if !self.admit(size) {
            return std::ptr::null_mut();
        }
        let ptr = RustAllocator.alloc(size);
        self.track(ptr)
    }

    fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return std::ptr::null_mut();
        };
        if !self.admit(total) {
            return std::ptr::null_mut();
        }
        let ptr = RustAllocator.calloc(count, size);
        self.track(ptr)
    }

    unsafe fn dealloc(&mut self, ptr: *mut u8) {
        unsafe {
            self.used = self.used.saturating_sub(RustAllocator::usable_size(ptr));
            RustAllocator.dealloc(ptr);
        }
    }

    unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        let old = unsafe { RustAllocator::usable_size(ptr) };
        if new_size > old && !self.admit(new_size - old) {
            return std::ptr::null_mut();
        }
        let moved = unsafe { RustAllocator.realloc(ptr, new_size) };
        if moved.is_null() {
            return moved;
        }
        self.used = self.used.saturating_sub(old);
        self.track(moved)
    }

    unsafe fn usable_size(ptr: *mut u8) -> usize {
        unsafe { RustAllocator::usable_size(ptr) }
    }
}
