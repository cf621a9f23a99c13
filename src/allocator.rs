//! The public allocator facade.
//!
//! The engine itself is strictly single-threaded; this wrapper puts it
//! behind a [`Mutex`] so the crate can satisfy [`GlobalAlloc`], which
//! demands `Sync`. The heap is built lazily on first use because
//! `#[global_allocator]` statics must be constructed in a `const` context,
//! long before the platform can be asked for memory.

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{audit::AuditError, header::ALIGNMENT, heap::Heap};

/// A segregated-fit allocator over a single growable heap segment.
///
/// # Examples
///
/// ## Standalone
///
/// ```rust
/// use segalloc::Segalloc;
///
/// let allocator = Segalloc::new();
///
/// let address = allocator.allocate(128).unwrap();
/// // Payload addresses are always 8-aligned.
/// assert_eq!(address.as_ptr() as usize % 8, 0);
///
/// unsafe { allocator.release(Some(address)) };
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use segalloc::Segalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Segalloc = Segalloc::new();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
#[derive(Debug)]
pub struct Segalloc {
    heap: Mutex<Option<Heap>>,
}

impl Segalloc {
    /// Builds the facade without touching the platform; the heap segment is
    /// reserved on the first operation.
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(None),
        }
    }

    /// Runs `op` on the heap, reserving it first if this is the first
    /// operation. A heap that cannot be reserved surfaces as the failure
    /// sentinel, same as exhaustion.
    fn with_heap<T>(&self, op: impl FnOnce(&mut Heap) -> Option<T>) -> Option<T> {
        let mut guard = self.heap.lock().ok()?;

        if guard.is_none() {
            *guard = Heap::init().ok();
        }

        guard.as_mut().and_then(op)
    }

    /// Allocates `size` bytes and returns the 8-aligned payload address, or
    /// `None` when `size` is zero or the heap is exhausted.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.with_heap(|heap| unsafe { heap.allocate(size) })
    }

    /// Releases an allocation. `None` and already-released addresses are
    /// tolerated as no-ops.
    ///
    /// # Safety
    ///
    /// `address` must be `None` or a pointer previously returned by this
    /// allocator.
    pub unsafe fn release(&self, address: Option<NonNull<u8>>) {
        let Some(bp) = address else { return };

        let _ = self.with_heap(|heap| {
            unsafe { heap.release(bp) };
            Some(())
        });
    }

    /// Resizes an allocation, preserving the payload prefix. A `None`
    /// address allocates; a zero `size` releases and returns `None`.
    ///
    /// # Safety
    ///
    /// `address` must be `None` or a pointer previously returned by this
    /// allocator; on success the old pointer must no longer be used.
    pub unsafe fn resize(
        &self,
        address: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        self.with_heap(|heap| unsafe { heap.resize(address, size) })
    }

    /// Allocates `count * size` zeroed bytes.
    pub fn zero_alloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.with_heap(|heap| unsafe { heap.zero_alloc(count, size) })
    }

    /// Checks every heap invariant. A facade that has not allocated yet is
    /// trivially consistent.
    pub fn audit(&self) -> Result<(), AuditError> {
        let Ok(guard) = self.heap.lock() else {
            return Ok(());
        };

        guard.as_ref().map_or(Ok(()), Heap::audit)
    }
}

impl Default for Segalloc {
    fn default() -> Self {
        Segalloc::new()
    }
}

unsafe impl GlobalAlloc for Segalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // 8-aligned payloads are all the heap layout can promise.
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.allocate(layout.size()) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.release(NonNull::new(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        match self.resize(NonNull::new(ptr), new_size) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.zero_alloc(layout.size(), 1) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_round_trip() {
        let allocator = Segalloc::new();
        allocator.audit().unwrap();

        let a = allocator.allocate(64).unwrap();
        let b = allocator.zero_alloc(16, 4).unwrap();
        allocator.audit().unwrap();

        unsafe {
            a.as_ptr().write_bytes(0x5A, 64);
            for i in 0..64 {
                assert_eq!(*b.as_ptr().add(i), 0);
            }

            let a = allocator.resize(Some(a), 256).unwrap();
            assert_eq!(*a.as_ptr(), 0x5A);
            allocator.audit().unwrap();

            allocator.release(Some(a));
            allocator.release(Some(b));
            allocator.release(None);
        }
        allocator.audit().unwrap();
    }

    #[test]
    fn global_alloc_contract() {
        let allocator = Segalloc::new();

        unsafe {
            let layout = Layout::from_size_align(100, 8).unwrap();
            let p = allocator.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 8, 0);

            p.write_bytes(0x42, 100);
            let p = allocator.realloc(p, layout, 500);
            assert!(!p.is_null());
            assert_eq!(*p, 0x42);
            assert_eq!(*p.add(99), 0x42);

            allocator.dealloc(p, Layout::from_size_align(500, 8).unwrap());
            allocator.audit().unwrap();

            let zeroed = allocator.alloc_zeroed(layout);
            assert!(!zeroed.is_null());
            for i in 0..100 {
                assert_eq!(*zeroed.add(i), 0);
            }

            // Alignments beyond the heap's guarantee are refused.
            let over_aligned = Layout::from_size_align(64, 16).unwrap();
            assert!(allocator.alloc(over_aligned).is_null());
        }
    }
}
