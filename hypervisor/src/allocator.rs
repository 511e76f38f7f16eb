//! The module containing the [`PageAllocator`] type.
//!
//! During VM-exit handling it is not safe to call host-OS functions for
//! memory (de)allocation; they can issue IPIs and TLB flushes and deadlock
//! the very processor that just trapped. The hypervisor therefore brings its
//! own allocator: the host driver hands it one big non-paged buffer up front
//! ([`attach`]) and every allocation afterwards is served from that pool
//! under a spinlock, page-aligned and page-granular.
//!
//! The pool is split into three parts:
//! 1. the page bitmap: one bit per pool page, set while the page is
//!    allocated;
//! 2. the allocation-size map: one `u16` per pool page, holding the number
//!    of consecutive pages owned by the allocation that starts there;
//! 3. the remaining pages, handed out to callers.
//!
//! The allocator is also registered as the global allocator (outside tests)
//! so that `Box` and `Vec` inside this crate draw from the pool.

use crate::error::ErrorCode;
use core::alloc::{GlobalAlloc, Layout};
use spin::Mutex;
use x86::current::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

/// The maximum number of pages a single allocation may span. The size map
/// stores the page count as `u16` with 0 meaning "free".
pub const MAX_ALLOCATION_PAGES: usize = u16::MAX as usize - 1;

/// The process-wide pool instance.
static PAGE_ALLOCATOR: PageAllocator = PageAllocator::new();

/// Returns the process-wide pool allocator.
pub fn page_allocator() -> &'static PageAllocator {
    &PAGE_ALLOCATOR
}

/// A fixed-pool, page-granular bitmap allocator.
pub struct PageAllocator {
    inner: Mutex<Pool>,
}

struct Pool {
    base: *mut u8,
    capacity: usize,
    bitmap: *mut u8,
    bitmap_bytes: usize,
    size_map: *mut u16,
    page_count: usize,
    /// The page offset right after the most recent allocation; first-fit
    /// searches start here and wrap once.
    hint: usize,
    overhead_bytes: usize,
    allocated_bytes: usize,
    free_bytes: usize,
}

// Safety: the raw pointers refer to the attached pool, which is exclusively
// owned by this allocator and only touched under the lock.
unsafe impl Send for Pool {}

impl PageAllocator {
    const fn new() -> Self {
        Self {
            inner: Mutex::new(Pool {
                base: core::ptr::null_mut(),
                capacity: 0,
                bitmap: core::ptr::null_mut(),
                bitmap_bytes: 0,
                size_map: core::ptr::null_mut(),
                page_count: 0,
                hint: 0,
                overhead_bytes: 0,
                allocated_bytes: 0,
                free_bytes: 0,
            }),
        }
    }

    /// Takes ownership of `size` bytes at `buffer` and prepares the pool
    /// metadata inside it. `buffer` is aligned up and `size` down to page
    /// boundaries; at least 3 pages must remain or the call fails with
    /// [`ErrorCode::InvalidArgument`].
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads and writes of `size` bytes for the
    /// lifetime of the allocator and must not be touched by anyone else.
    pub unsafe fn attach(&self, buffer: *mut u8, size: usize) -> Result<(), ErrorCode> {
        if size < BASE_PAGE_SIZE * 3 {
            return Err(ErrorCode::InvalidArgument);
        }

        // Align the base up and the size down to page boundaries.
        let misalignment = buffer.align_offset(BASE_PAGE_SIZE);
        let base = unsafe { buffer.add(misalignment) };
        let size = (size - misalignment) & !(BASE_PAGE_SIZE - 1);
        if size < BASE_PAGE_SIZE * 3 {
            return Err(ErrorCode::InvalidArgument);
        }

        let page_count = size >> BASE_PAGE_SHIFT;
        let bitmap_bytes = page_count.div_ceil(8);
        let size_map_bytes = page_count * size_of::<u16>();

        // The bitmap lives at the start of the pool, the size map right
        // after it; both regions are rounded up to whole pages so that the
        // pages they occupy can be marked allocated in the bitmap itself.
        let bitmap_pages = size_to_pages(bitmap_bytes);
        let size_map_pages = size_to_pages(size_map_bytes);
        let reserved_pages = bitmap_pages + size_map_pages;
        if reserved_pages >= page_count {
            return Err(ErrorCode::InvalidArgument);
        }

        let mut pool = self.inner.lock();
        if !pool.base.is_null() {
            return Err(ErrorCode::NotSupported);
        }

        pool.base = base;
        pool.capacity = size;
        pool.bitmap = base;
        pool.bitmap_bytes = bitmap_bytes;
        pool.size_map = unsafe { base.add(bitmap_pages << BASE_PAGE_SHIFT) }.cast::<u16>();
        pool.page_count = page_count;
        pool.hint = 0;
        pool.overhead_bytes = reserved_pages << BASE_PAGE_SHIFT;
        pool.allocated_bytes = 0;
        pool.free_bytes = size - pool.overhead_bytes;

        unsafe {
            core::ptr::write_bytes(pool.bitmap, 0, bitmap_bytes);
            core::ptr::write_bytes(pool.size_map, 0, page_count);
        }

        // Mark the metadata pages themselves as allocated.
        pool.mark(0, bitmap_pages);
        pool.set_size(0, bitmap_pages);
        pool.mark(bitmap_pages, size_map_pages);
        pool.set_size(bitmap_pages, size_map_pages);

        // Fill the rest with garbage to make use of uninitialized memory
        // visible while debugging.
        unsafe {
            core::ptr::write_bytes(
                base.add(pool.overhead_bytes),
                0xcc,
                size - pool.overhead_bytes,
            );
        }

        log::debug!(
            "page pool attached: {size:#x} bytes, {page_count} pages, {reserved_pages} reserved"
        );
        Ok(())
    }

    /// Releases the pool. All client allocations must have been freed;
    /// leftovers are debug-asserted.
    pub fn detach(&self) {
        let mut pool = self.inner.lock();
        if pool.base.is_null() {
            return;
        }
        debug_assert_eq!(pool.allocated_bytes, 0, "page pool leak on detach");
        *pool = Pool {
            base: core::ptr::null_mut(),
            capacity: 0,
            bitmap: core::ptr::null_mut(),
            bitmap_bytes: 0,
            size_map: core::ptr::null_mut(),
            page_count: 0,
            hint: 0,
            overhead_bytes: 0,
            allocated_bytes: 0,
            free_bytes: 0,
        };
    }

    /// Allocates `size` bytes rounded up to whole pages. A zero-byte request
    /// is served as one page. Returns null when the pool is exhausted or the
    /// request exceeds [`MAX_ALLOCATION_PAGES`].
    pub fn allocate(&self, size: usize) -> *mut u8 {
        // Serve at least 1 page, even for a zero-byte request.
        let size = if size == 0 { 1 } else { size };

        let pages = size_to_pages(size);
        if pages > MAX_ALLOCATION_PAGES {
            return core::ptr::null_mut();
        }

        let mut pool = self.inner.lock();
        if pool.base.is_null() {
            return core::ptr::null_mut();
        }

        // First-fit from the hint, wrapping to the pool start once.
        let offset = match pool
            .find_first_clear(pool.hint, pages)
            .or_else(|| pool.find_first_clear(0, pages))
        {
            Some(offset) => offset,
            None => return core::ptr::null_mut(),
        };

        pool.mark(offset, pages);
        pool.set_size(offset, pages);
        pool.hint = offset + pages;
        pool.allocated_bytes += pages << BASE_PAGE_SHIFT;
        pool.free_bytes -= pages << BASE_PAGE_SHIFT;

        // Contents are whatever the previous owner left there, on top of the
        // initial 0xCC fill.
        unsafe { pool.base.add(offset << BASE_PAGE_SHIFT) }
    }

    /// Frees the allocation starting at `va`. Freeing null is a no-op;
    /// foreign pointers and double frees are debug-asserted no-ops.
    pub fn free(&self, va: *mut u8) {
        if va.is_null() {
            return;
        }
        debug_assert_eq!(va as usize & (BASE_PAGE_SIZE - 1), 0, "freeing unaligned pointer");

        let mut pool = self.inner.lock();
        if pool.base.is_null() || !contains_va(&pool, va) {
            debug_assert!(false, "freeing a pointer the pool does not own");
            return;
        }

        let offset = (va as usize - pool.base as usize) >> BASE_PAGE_SHIFT;
        let pages = pool.get_size(offset) as usize;
        if pages == 0 {
            debug_assert!(false, "double free at page offset {offset}");
            return;
        }

        pool.set_size(offset, 0);
        pool.unmark(offset, pages);
        pool.allocated_bytes -= pages << BASE_PAGE_SHIFT;
        pool.free_bytes += pages << BASE_PAGE_SHIFT;
    }

    /// Returns whether `va` points into the pool.
    pub fn contains(&self, va: *const u8) -> bool {
        let pool = self.inner.lock();
        !pool.base.is_null() && contains_va(&pool, va.cast_mut())
    }

    /// Returns how many bytes of client allocations are outstanding.
    pub fn allocated_bytes(&self) -> usize {
        self.inner.lock().allocated_bytes
    }

    /// Returns how many bytes remain allocatable.
    pub fn free_bytes(&self) -> usize {
        self.inner.lock().free_bytes
    }
}

fn contains_va(pool: &Pool, va: *mut u8) -> bool {
    (va as usize) >= (pool.base as usize) && (va as usize) < (pool.base as usize + pool.capacity)
}

impl Pool {
    fn bit(&self, index: usize) -> bool {
        // Safety: index < page_count <= bitmap_bytes * 8.
        unsafe { (*self.bitmap.add(index / 8) >> (index % 8)) & 1 != 0 }
    }

    fn mark(&mut self, offset: usize, count: usize) {
        for index in offset..offset + count {
            // Safety: caller verified the range is within the pool.
            unsafe { *self.bitmap.add(index / 8) |= 1 << (index % 8) };
        }
    }

    fn unmark(&mut self, offset: usize, count: usize) {
        for index in offset..offset + count {
            // Safety: caller verified the range is within the pool.
            unsafe { *self.bitmap.add(index / 8) &= !(1 << (index % 8)) };
        }
    }

    fn set_size(&mut self, offset: usize, pages: usize) {
        // Safety: offset < page_count, the size map has page_count slots.
        unsafe { *self.size_map.add(offset) = pages as u16 };
    }

    fn get_size(&self, offset: usize) -> u16 {
        // Safety: offset < page_count, the size map has page_count slots.
        unsafe { *self.size_map.add(offset) }
    }

    /// Finds `count` consecutive clear bits at or after `start`, without
    /// wrapping.
    fn find_first_clear(&self, start: usize, count: usize) -> Option<usize> {
        if count == 0 || start + count > self.page_count {
            return None;
        }
        let mut candidate = start;
        let mut run = 0;
        for index in start..self.page_count {
            if self.bit(index) {
                candidate = index + 1;
                run = 0;
            } else {
                run += 1;
                if run == count {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

/// Computes how many pages are needed for the given bytes.
pub(crate) fn size_to_pages(size: usize) -> usize {
    const PAGE_MASK: usize = 0xfff;

    (size >> BASE_PAGE_SHIFT) + usize::from((size & PAGE_MASK) != 0)
}

/// The adapter routing `alloc::alloc` through the pool. Alignments up to one
/// page come for free since the pool only hands out page-aligned memory;
/// larger alignments are refused.
pub struct GlobalPoolAllocator;

unsafe impl GlobalAlloc for GlobalPoolAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BASE_PAGE_SIZE {
            return core::ptr::null_mut();
        }
        PAGE_ALLOCATOR.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        PAGE_ALLOCATOR.free(ptr);
    }
}

#[cfg(not(test))]
#[global_allocator]
static GLOBAL_ALLOCATOR: GlobalPoolAllocator = GlobalPoolAllocator;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Page;

    fn backing(pages: usize) -> Vec<Page> {
        vec![Page::new(); pages]
    }

    fn attached(pages: usize) -> (PageAllocator, Vec<Page>) {
        let mut buffer = backing(pages);
        let allocator = PageAllocator::new();
        unsafe {
            allocator
                .attach(buffer.as_mut_ptr().cast(), pages * BASE_PAGE_SIZE)
                .unwrap();
        }
        (allocator, buffer)
    }

    #[test]
    fn attach_rejects_tiny_pools() {
        let mut buffer = backing(2);
        let allocator = PageAllocator::new();
        let status =
            unsafe { allocator.attach(buffer.as_mut_ptr().cast(), 2 * BASE_PAGE_SIZE) };
        assert_eq!(status.unwrap_err(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn allocations_are_page_aligned_and_distinct() {
        let (allocator, _buffer) = attached(16);
        let a = allocator.allocate(1);
        let b = allocator.allocate(BASE_PAGE_SIZE + 1);
        let c = allocator.allocate(BASE_PAGE_SIZE);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert_eq!(a as usize % BASE_PAGE_SIZE, 0);
        assert_eq!(b as usize % BASE_PAGE_SIZE, 0);
        // b spans two pages, so c starts two pages after it.
        assert_eq!(b as usize + 2 * BASE_PAGE_SIZE, c as usize);
        assert_eq!(allocator.allocated_bytes(), 4 * BASE_PAGE_SIZE);
        allocator.free(a);
        allocator.free(b);
        allocator.free(c);
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn zero_byte_allocation_returns_one_page() {
        let (allocator, _buffer) = attached(8);
        let a = allocator.allocate(0);
        assert!(!a.is_null());
        assert_eq!(allocator.allocated_bytes(), BASE_PAGE_SIZE);
        allocator.free(a);
    }

    #[test]
    fn oversized_allocation_is_rejected() {
        let (allocator, _buffer) = attached(8);
        assert!(allocator.allocate((MAX_ALLOCATION_PAGES + 1) * BASE_PAGE_SIZE).is_null());
    }

    #[test]
    fn exhaustion_returns_null_and_freeing_recovers() {
        let (allocator, _buffer) = attached(8);
        let free_before = allocator.free_bytes();
        let a = allocator.allocate(free_before);
        assert!(!a.is_null());
        assert!(allocator.allocate(1).is_null());
        assert_eq!(allocator.free_bytes(), 0);
        allocator.free(a);
        assert_eq!(allocator.free_bytes(), free_before);
    }

    #[test]
    fn freed_space_is_reused_after_wrap() {
        let (allocator, _buffer) = attached(8);
        let free_before = allocator.free_bytes();
        let first = allocator.allocate(BASE_PAGE_SIZE);
        let rest = allocator.allocate(free_before - BASE_PAGE_SIZE);
        assert!(!first.is_null() && !rest.is_null());
        // The hint now sits past the end; only the wrapped search finds the
        // hole opened by this free.
        allocator.free(first);
        let again = allocator.allocate(BASE_PAGE_SIZE);
        assert_eq!(first, again);
        allocator.free(again);
        allocator.free(rest);
    }

    #[test]
    fn counters_balance_with_the_pool_size() {
        let (allocator, _buffer) = attached(16);
        let total = allocator.free_bytes();
        let a = allocator.allocate(3 * BASE_PAGE_SIZE);
        let b = allocator.allocate(BASE_PAGE_SIZE);
        assert_eq!(allocator.allocated_bytes() + allocator.free_bytes(), total);
        allocator.free(a);
        assert_eq!(allocator.allocated_bytes() + allocator.free_bytes(), total);
        allocator.free(b);
    }

    #[test]
    fn contains_tracks_pool_bounds() {
        let (allocator, buffer) = attached(8);
        let inside = allocator.allocate(1);
        assert!(allocator.contains(inside));
        let outside = (buffer.as_ptr() as usize + buffer.len() * BASE_PAGE_SIZE) as *const u8;
        assert!(!allocator.contains(outside));
        allocator.free(inside);
    }

    #[test]
    fn unaligned_buffer_is_aligned_up() {
        let mut buffer = backing(9);
        let allocator = PageAllocator::new();
        let unaligned = unsafe { buffer.as_mut_ptr().cast::<u8>().add(0x10) };
        unsafe {
            allocator
                .attach(unaligned, 9 * BASE_PAGE_SIZE - 0x10)
                .unwrap();
        }
        let a = allocator.allocate(1);
        assert_eq!(a as usize % BASE_PAGE_SIZE, 0);
        allocator.free(a);
    }
}
