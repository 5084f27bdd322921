//! Fiber stacks
//!
//! Each fiber owns one mmap'd region: a PROT_NONE guard page at the low
//! end, then the usable stack growing down from `top()`. Overflow hits the
//! guard page and faults instead of corrupting the neighbour allocation.

use std::ptr;

use tracing::error;
use weft_core::error::{Error, Result};

/// Heap stack for one fiber
pub struct FiberStack {
    /// Mapping base (the guard page)
    base: *mut u8,
    /// Whole mapping, guard included
    total: usize,
    /// Usable bytes above the guard
    usable: usize,
}

// The mapping is plain anonymous memory; the pointer is not aliased
// elsewhere. Fibers migrate between workers, so their stacks must too.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

#[inline]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl FiberStack {
    /// Map a stack with `size` usable bytes (rounded up to whole pages)
    pub fn alloc(size: usize) -> Result<Self> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let total = usable + page; // one guard page below

        // Reserve the whole region inaccessible, then open up the stack
        // pages; the guard page keeps its PROT_NONE from the initial map.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let e = Error::last_os("mmap");
            error!(target: "system", size, "fiber stack allocation failed: {}", e);
            return Err(e);
        }

        let rc = unsafe {
            libc::mprotect(
                (base as *mut u8).add(page) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            let e = Error::last_os("mprotect");
            error!(target: "system", size, "fiber stack protection failed: {}", e);
            unsafe { libc::munmap(base, total) };
            return Err(e);
        }

        Ok(Self {
            base: base as *mut u8,
            total,
            usable,
        })
    }

    /// One past the highest usable byte; the initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.usable
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        debug_assert_eq!(rc, 0);
    }
}
