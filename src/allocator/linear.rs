use super::TempAllocator;
use parking_lot::Mutex;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

const BASE_ALIGN: usize = 64;

struct Cursor {
    offset: usize,
    live: usize,
}

/// Fixed-size bump allocator for per-update scratch memory.
///
/// Allocations advance a cursor through one backing block. Freeing the most
/// recent allocation rolls the cursor back, and once every allocation has
/// been freed the whole block is reusable, which is the normal state between
/// two updates.
pub struct LinearTempAllocator {
    base_ptr: NonNull<u8>,
    capacity: usize,
    cursor: Mutex<Cursor>,
}

impl LinearTempAllocator {
    /// Creates an allocator with `capacity` bytes of backing memory.
    ///
    /// # Panics
    ///
    /// Panics if the backing block cannot be allocated.
    pub fn new(capacity: usize) -> Self {
        let layout = Self::block_layout(capacity);
        // SAFETY: block_layout never returns a zero-sized layout.
        let ptr = unsafe { alloc(layout) };
        let Some(base_ptr) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };

        Self {
            base_ptr,
            capacity,
            cursor: Mutex::new(Cursor { offset: 0, live: 0 }),
        }
    }

    fn block_layout(capacity: usize) -> Layout {
        Layout::from_size_align(capacity.max(1), BASE_ALIGN)
            .unwrap_or_else(|_| panic!("invalid scratch capacity {capacity}"))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently handed out, including alignment padding.
    pub fn used_bytes(&self) -> usize {
        self.cursor.lock().offset
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.cursor.lock().live
    }
}

impl TempAllocator for LinearTempAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let mut cursor = self.cursor.lock();
        let base = self.base_ptr.as_ptr() as usize;
        let start = (base + cursor.offset).checked_next_multiple_of(layout.align())? - base;
        let end = start.checked_add(layout.size())?;
        if end > self.capacity {
            return None;
        }
        cursor.offset = end;
        cursor.live += 1;
        // SAFETY: start <= capacity, inside the backing block.
        NonNull::new(unsafe { self.base_ptr.as_ptr().add(start) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        let mut cursor = self.cursor.lock();
        assert!(cursor.live > 0, "scratch allocator freed more than it allocated");
        cursor.live -= 1;
        let start = ptr.as_ptr() as usize - self.base_ptr.as_ptr() as usize;
        if cursor.live == 0 {
            cursor.offset = 0;
        } else if start + layout.size() == cursor.offset {
            cursor.offset = start;
        }
    }

    fn available(&self) -> usize {
        self.capacity - self.cursor.lock().offset
    }
}

impl Drop for LinearTempAllocator {
    fn drop(&mut self) {
        let live = self.cursor.get_mut().live;
        if live != 0 {
            log::error!("scratch allocator dropped with {live} live allocation(s)");
        }
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base_ptr.as_ptr(), Self::block_layout(self.capacity)) };
    }
}

// SAFETY: the block is owned; all cursor updates go through the mutex.
unsafe impl Send for LinearTempAllocator {}
unsafe impl Sync for LinearTempAllocator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_are_aligned_and_bounded() {
        let allocator = LinearTempAllocator::new(256);
        let a = allocator.allocate(Layout::from_size_align(3, 1).unwrap()).unwrap();
        let b = allocator.allocate(Layout::new::<u64>()).unwrap();
        assert_eq!(b.as_ptr() as usize % 8, 0);
        assert_eq!(allocator.used_bytes(), 16);
        assert!(allocator
            .allocate(Layout::from_size_align(512, 8).unwrap())
            .is_none());
        unsafe {
            allocator.free(b, Layout::new::<u64>());
            allocator.free(a, Layout::from_size_align(3, 1).unwrap());
        }
        assert_eq!(allocator.used_bytes(), 0);
    }

    #[test]
    fn test_freeing_everything_resets() {
        let allocator = LinearTempAllocator::new(128);
        let layout = Layout::array::<u32>(8).unwrap();
        let a = allocator.allocate(layout).unwrap();
        let b = allocator.allocate(layout).unwrap();
        // Out of order: the cursor only rolls back once nothing is live.
        unsafe { allocator.free(a, layout) };
        assert_eq!(allocator.used_bytes(), 64);
        unsafe { allocator.free(b, layout) };
        assert_eq!(allocator.available(), 128);
        assert_eq!(allocator.live_allocations(), 0);
    }
}
