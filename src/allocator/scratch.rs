use super::TempAllocator;
use crate::error::StepError;
use std::alloc::Layout;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

/// Typed, default-initialized slice living in a [`TempAllocator`].
///
/// The memory goes back to the allocator when the slice is dropped.
pub struct ScratchSlice<T> {
    allocator: Arc<dyn TempAllocator>,
    ptr: NonNull<T>,
    len: usize,
    layout: Layout,
}

impl<T: Default> ScratchSlice<T> {
    pub fn new(allocator: &Arc<dyn TempAllocator>, len: usize) -> Result<Self, StepError> {
        let exhausted = || StepError::ScratchExhausted {
            requested: len.saturating_mul(std::mem::size_of::<T>()),
            available: allocator.available(),
        };
        let layout = Layout::array::<T>(len).map_err(|_| exhausted())?;

        let ptr = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            allocator.allocate(layout).ok_or_else(exhausted)?.cast::<T>()
        };
        for i in 0..len {
            // SAFETY: `ptr` is valid for `len` writes of T.
            unsafe { ptr.as_ptr().add(i).write(T::default()) };
        }

        Ok(ScratchSlice {
            allocator: allocator.clone(),
            ptr,
            len,
            layout,
        })
    }
}

impl<T> Deref for ScratchSlice<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: `len` initialized elements starting at `ptr`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for ScratchSlice<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as above, and `&mut self` is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for ScratchSlice<T> {
    fn drop(&mut self) {
        let layout = self.layout;
        // SAFETY: the elements were initialized in `new` and are dropped once.
        unsafe {
            std::ptr::drop_in_place(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            ));
            if layout.size() != 0 {
                self.allocator.free(self.ptr.cast(), layout);
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ScratchSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

// SAFETY: the slice owns its elements; the allocator is Send + Sync.
unsafe impl<T: Send> Send for ScratchSlice<T> {}
unsafe impl<T: Sync> Sync for ScratchSlice<T> {}
