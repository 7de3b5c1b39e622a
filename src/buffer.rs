//! Pooled buffer descriptor.
//!
//! A [`PooledBuf`] is the user-visible projection of an allocation handle:
//! a data pointer plus the requested length, the maximum length the handle
//! can grow into without moving, and the bookkeeping the arena needs to
//! route the eventual free back to the owning chunk. Descriptors do not free
//! themselves on drop; the arena calls `Chunk::free` explicitly and may hand
//! the spent descriptor back so the chunk can recycle the shell.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::arena::ThreadCacheId;
use crate::chunk::Chunk;
use crate::handle::Handle;

/// A view over one live allocation inside a chunk.
///
/// The descriptor stays valid while its handle is live and the owning chunk
/// is kept pinned by the arena. Reading or writing through it after the
/// handle was freed is a caller bug, exactly as with any pooled buffer.
pub struct PooledBuf {
    chunk: NonNull<Chunk>,
    handle: Handle,
    ptr: NonNull<u8>,
    length: usize,
    max_length: usize,
    thread_cache: ThreadCacheId,
}

// SAFETY: the descriptor only carries raw pointers into pool-owned memory;
// exclusive access to the bytes follows from the one-handle-one-owner
// discipline of the allocator.
unsafe impl Send for PooledBuf {}
unsafe impl Sync for PooledBuf {}

impl PooledBuf {
    pub(crate) fn new(
        chunk: NonNull<Chunk>,
        handle: Handle,
        ptr: NonNull<u8>,
        length: usize,
        max_length: usize,
        thread_cache: ThreadCacheId,
    ) -> Self {
        Self {
            chunk,
            handle,
            ptr,
            length,
            max_length,
            thread_cache,
        }
    }

    /// Repoints a recycled descriptor shell at a new allocation.
    pub(crate) fn reinit(
        &mut self,
        chunk: NonNull<Chunk>,
        handle: Handle,
        ptr: NonNull<u8>,
        length: usize,
        max_length: usize,
        thread_cache: ThreadCacheId,
    ) {
        self.chunk = chunk;
        self.handle = handle;
        self.ptr = ptr;
        self.length = length;
        self.max_length = max_length;
        self.thread_cache = thread_cache;
    }

    /// The handle naming this allocation.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// The chunk that produced this buffer; used by the arena to route the
    /// free. The pointer is only valid while the arena keeps the chunk alive
    /// and pinned.
    #[inline]
    #[must_use]
    pub fn chunk(&self) -> NonNull<Chunk> {
        self.chunk
    }

    /// Requested length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns `true` if the requested length is zero.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes the allocation can grow to in place: the run length for run
    /// handles, the element size for subpage handles.
    #[inline]
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Opaque thread-cache token recorded at allocation time.
    #[inline]
    #[must_use]
    pub fn thread_cache(&self) -> ThreadCacheId {
        self.thread_cache
    }

    /// Raw pointer to the first byte.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable raw pointer to the first byte.
    #[inline]
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The buffer as a byte slice of the requested length.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr covers at least `length` bytes of the backing region
        // and the handle is exclusively ours.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.length) }
    }

    /// The buffer as a mutable byte slice of the requested length.
    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`, plus we hold `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.length) }
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for PooledBuf {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for PooledBuf {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("handle", &self.handle)
            .field("len", &self.length)
            .field("max_length", &self.max_length)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::arena::{SubpagePools, ThreadCacheId};
    use crate::chunk::ChunkBuilder;

    #[test]
    fn buffer_reads_and_writes_round_trip() {
        let mut chunk = ChunkBuilder::new().build().unwrap();
        let pools = SubpagePools::new(8192);
        let mut buf = chunk
            .allocate(&pools, 8192, 8192, ThreadCacheId::default())
            .unwrap();

        assert_eq!(buf.len(), 8192);
        assert_eq!(buf.max_length(), 8192);
        assert!(!buf.is_empty());

        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        for (i, byte) in buf.iter().enumerate() {
            assert_eq!(*byte, (i % 251) as u8);
        }

        let handle = buf.handle();
        chunk.free(&pools, handle, Some(buf));
    }

    #[test]
    fn requested_length_is_what_deref_exposes() {
        let mut chunk = ChunkBuilder::new().build().unwrap();
        let pools = SubpagePools::new(8192);
        let buf = chunk
            .allocate(&pools, 5000, 8192, ThreadCacheId::default())
            .unwrap();

        assert_eq!(buf.len(), 5000);
        assert_eq!(buf.max_length(), 8192);
        assert_eq!(buf.as_slice().len(), 5000);

        let handle = buf.handle();
        chunk.free(&pools, handle, Some(buf));
    }

    #[test]
    fn thread_cache_token_is_passed_through() {
        let mut chunk = ChunkBuilder::new().build().unwrap();
        let pools = SubpagePools::new(8192);
        let buf = chunk
            .allocate(&pools, 8192, 8192, ThreadCacheId(7))
            .unwrap();
        assert_eq!(buf.thread_cache(), ThreadCacheId(7));

        let handle = buf.handle();
        chunk.free(&pools, handle, Some(buf));
    }

    #[test]
    fn debug_output_names_the_type() {
        let mut chunk = ChunkBuilder::new().build().unwrap();
        let pools = SubpagePools::new(8192);
        let buf = chunk
            .allocate(&pools, 64, 64, ThreadCacheId::default())
            .unwrap();

        let rendered = format!("{buf:?}");
        assert!(rendered.contains("PooledBuf"));
        assert!(rendered.contains("len"));

        let handle = buf.handle();
        chunk.free(&pools, handle, Some(buf));
        chunk.destroy(&pools);
    }
}
