//! Scratch allocators scoped to one physics update.
//!
//! Every per-step buffer (body-pair slots, active constraint lists, CCD body
//! lists) is carved from a [`TempAllocator`] at the start of an update and
//! returned when the update finishes. Nothing allocated here outlives the call
//! that allocated it.

mod linear;
mod scratch;

pub use linear::LinearTempAllocator;
pub use scratch::ScratchSlice;

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Byte allocator handed to [`PhysicsSystem::update`](crate::physics::PhysicsSystem::update).
pub trait TempAllocator: Send + Sync {
    /// Returns `None` when the request does not fit.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns memory obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with the same `layout` and must not
    /// be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);

    /// Bytes that can still be allocated, ignoring alignment padding.
    fn available(&self) -> usize;
}

/// Forwards every request to the global heap. Never runs out.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapTempAllocator;

impl TempAllocator for HeapTempAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return NonNull::new(layout.align() as *mut u8);
        }
        // SAFETY: size is non-zero.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }

    fn available(&self) -> usize {
        usize::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocator_round_trip() {
        let heap = HeapTempAllocator;
        let layout = Layout::array::<u64>(32).unwrap();
        let ptr = heap.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % layout.align(), 0);
        unsafe { heap.free(ptr, layout) };
        assert_eq!(heap.available(), usize::MAX);
    }
}
