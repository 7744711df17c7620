//! Cache buffer memory.
//!
//! All extent buffers come from one contiguous, page-aligned allocation made
//! at cache init and split into `cache_size / extent_size` slices. Extents
//! are recycled; their buffer slices are not, so every address handed out
//! stays valid for the lifetime of the cache.

use std::alloc;
use std::alloc::Layout;
use std::ptr::NonNull;

use crate::error::CacheError;

/// The page-aligned buffer slab backing the extent pool.
pub(crate) struct BufferSlab {
    base: NonNull<u8>,
    layout: Layout,
    extent_size: usize,
    extent_count: usize,
}

// The slab hands out raw slice addresses; the extent state machine
// serialises writers per extent (at most one write-comm in flight) while
// allowing concurrent readers over clean data.
unsafe impl Send for BufferSlab {}
unsafe impl Sync for BufferSlab {}

impl BufferSlab {
    pub(crate) fn new(cache_size: usize, extent_size: usize) -> Result<Self, CacheError> {
        let align = page_size::get();
        let layout = Layout::from_size_align(cache_size, align)
            .map_err(|_| CacheError::Config("cache size not representable"))?;
        // Extents start blank; hand out zeroed memory.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(CacheError::NoMem)?;
        Ok(BufferSlab {
            base,
            layout,
            extent_size,
            extent_count: cache_size / extent_size,
        })
    }

    pub(crate) fn extent_count(&self) -> usize {
        self.extent_count
    }

    /// Stable buffer address of extent slot `idx`.
    pub(crate) fn extent_addr(&self, idx: usize) -> NonNull<u8> {
        debug_assert!(idx < self.extent_count);
        // Slices are disjoint and in-bounds by construction.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(idx * self.extent_size)) }
    }
}

impl Drop for BufferSlab {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for BufferSlab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSlab")
            .field("extent_size", &self.extent_size)
            .field("extent_count", &self.extent_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_disjoint_and_aligned() {
        let slab = BufferSlab::new(1 << 20, 32768).unwrap();
        assert_eq!(slab.extent_count(), 32);
        let page = page_size::get();
        assert_eq!(slab.extent_addr(0).as_ptr() as usize % page, 0);
        for i in 1..32 {
            let prev = slab.extent_addr(i - 1).as_ptr() as usize;
            let cur = slab.extent_addr(i).as_ptr() as usize;
            assert_eq!(cur - prev, 32768);
        }
    }

    #[test]
    fn memory_starts_zeroed() {
        let slab = BufferSlab::new(65536, 32768).unwrap();
        let p = slab.extent_addr(1).as_ptr();
        let bytes = unsafe { std::slice::from_raw_parts(p, 32768) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
