//! Backing-region provider.
//!
//! A chunk needs one contiguous region for its whole lifetime; where that
//! region comes from is pluggable through the [`Allocator`] trait. The
//! [`DefaultAllocator`] takes regions from the global allocator with a large
//! alignment, which is the right choice almost everywhere; custom
//! implementations can substitute mmap'd, pinned or registered memory for
//! zero-copy I/O stacks.

use std::alloc::{alloc, dealloc, Layout};
use std::io::{Error, ErrorKind, Result};
use std::ptr::NonNull;

/// Source of the contiguous regions backing chunks.
///
/// Implementations must hand out regions that stay valid and immovable until
/// the matching [`deallocate`](Self::deallocate), and must tolerate the
/// region sizes chunks ask for: `chunk_size + offset` bytes for pooled
/// chunks, arbitrary sizes for unpooled ones.
pub trait Allocator: Send + Sync {
    /// Reserves a region of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error when the region cannot be provided; the chunk
    /// constructor surfaces it unchanged.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// Releases a region previously returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from a call to `allocate` on this same provider with
    /// this same `size`, and must not be released twice.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);
}

/// Region provider backed by the global allocator.
///
/// Regions are aligned to 2 MiB on 64-bit targets so the kernel can promote
/// them to huge pages, and to 4 KiB elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocator;

impl DefaultAllocator {
    #[cfg(target_pointer_width = "64")]
    const fn alignment() -> usize {
        2 * 1024 * 1024
    }

    #[cfg(not(target_pointer_width = "64"))]
    const fn alignment() -> usize {
        4096
    }

    /// Creates the default region provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Allocator for DefaultAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "region size must be > 0"));
        }

        let layout = Layout::from_size_align(size, Self::alignment())
            .map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;

        // SAFETY: layout has non-zero size and a power-of-two alignment.
        let ptr = unsafe { alloc(layout) };

        NonNull::new(ptr)
            .ok_or_else(|| Error::new(ErrorKind::OutOfMemory, "backing region allocation failed"))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        if size == 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size, Self::alignment()) {
            // SAFETY: ptr was produced by `allocate` with this exact layout.
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_usable_end_to_end() {
        let provider = DefaultAllocator::new();
        let size = 16 * 1024 * 1024;
        let region = provider.allocate(size).unwrap();

        unsafe {
            std::ptr::write_bytes(region.as_ptr(), 0x5A, size);
            assert_eq!(*region.as_ptr(), 0x5A);
            assert_eq!(*region.as_ptr().add(size - 1), 0x5A);
            provider.deallocate(region, size);
        }
    }

    #[test]
    fn zero_sized_regions_are_refused() {
        let provider = DefaultAllocator::new();
        let err = provider.allocate(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn odd_sizes_work_for_unpooled_regions() {
        let provider = DefaultAllocator::new();
        let size = 5_000_001;
        let region = provider.allocate(size).unwrap();
        unsafe { provider.deallocate(region, size) };
    }
}
