//! The seam between chunks and their enclosing arena.
//!
//! The allocator core deliberately knows nothing about chunk lists, thread
//! caches or the I/O threads driving it. What it does need from the arena is
//! small and fixed:
//!
//! - a per-element-size pool of partially filled subpages, with one mutex per
//!   pool bucket ([`SubpagePools`]),
//! - the capacity normalisation rule callers apply before asking a chunk for
//!   memory ([`normalize_capacity`]),
//! - an opaque thread-cache token threaded into buffer descriptors
//!   ([`ThreadCacheId`]).
//!
//! Lock discipline: chunk state is mutated through `&mut Chunk`, which the
//! arena provides by wrapping each chunk in its own lock; a bucket mutex is
//! only ever taken while that exclusivity is already held, and never two
//! buckets at once. The one path that runs without any chunk borrow,
//! [`SubpagePools::allocate_pooled`], touches nothing but the bucket it
//! locks, so the global acquisition order stays total.

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::buffer::PooledBuf;
use crate::handle::Handle;
use crate::intrusive_list::SubpageList;
use crate::subpage::MIN_ELEM_SIZE;

/// Opaque identifier of the thread cache on whose behalf an allocation was
/// made. The allocator only stores it into buffer descriptors; the arena
/// gives it meaning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ThreadCacheId(
    /// Raw token value, assigned by the arena.
    pub u64,
);

/// Rounds a requested capacity up to the allocator's granularity: the next
/// power of two, but no less than 16 bytes.
///
/// Chunks require normalised capacities; the arena applies this before every
/// chunk call. Results larger than the chunk size are simply refused by the
/// chunk, which is how oversized requests fall through to the unpooled path.
#[must_use]
pub fn normalize_capacity(req_capacity: usize) -> usize {
    req_capacity.max(MIN_ELEM_SIZE).next_power_of_two()
}

/// Per-element-size pools of subpages with free slots.
///
/// One instance serves every chunk of an arena, so a small allocation can be
/// satisfied from any chunk that already has a partially filled leaf of the
/// right element size. Buckets cover the power-of-two sizes
/// `16, 32, …, page_size / 2`, each behind its own mutex.
pub struct SubpagePools {
    page_size: usize,
    buckets: Box<[Mutex<SubpageList>]>,
}

impl SubpagePools {
    /// Creates empty pools for chunks of the given page size.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        let bucket_count = (page_size.trailing_zeros() as usize)
            .saturating_sub(MIN_ELEM_SIZE.trailing_zeros() as usize);
        Self {
            page_size,
            buckets: (0..bucket_count)
                .map(|_| Mutex::new(SubpageList::new()))
                .collect(),
        }
    }

    /// Page size these pools were built for.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The list bucket holding subpages of `elem_size`.
    pub(crate) fn pool_head(&self, elem_size: usize) -> &Mutex<SubpageList> {
        debug_assert!(elem_size.is_power_of_two());
        debug_assert!((MIN_ELEM_SIZE..self.page_size).contains(&elem_size));
        let idx = (elem_size.trailing_zeros() - MIN_ELEM_SIZE.trailing_zeros()) as usize;
        &self.buckets[idx]
    }

    /// Serves a small allocation from an already pooled subpage, if any.
    ///
    /// This is the fast path the arena tries before involving a chunk: it
    /// takes only the bucket mutex, reuses a leaf some chunk has already
    /// split, and composes the same kind of handle `Chunk::allocate` would.
    /// Returns `None` when the pool for `norm_capacity` is empty or the
    /// request is not subpage-sized; the caller then falls back to a chunk.
    #[must_use]
    pub fn allocate_pooled(
        &self,
        req_capacity: usize,
        norm_capacity: usize,
        thread_cache: ThreadCacheId,
    ) -> Option<PooledBuf> {
        debug_assert!(req_capacity <= norm_capacity);
        if norm_capacity >= self.page_size || norm_capacity < MIN_ELEM_SIZE {
            return None;
        }

        let mut list = self.pool_head(norm_capacity).lock();
        let front = list.front()?;
        // SAFETY: linked subpages are owned by live, pinned chunks, and we
        // hold the bucket mutex that serialises all access to them.
        let subpage = unsafe { &mut *front.as_ptr() };
        debug_assert_eq!(subpage.elem_size(), norm_capacity);
        debug_assert!(subpage.do_not_destroy());

        let token = subpage.allocate(&mut list)?;
        let handle = Handle::encode(subpage.leaf_id(), token);
        Some(PooledBuf::new(
            subpage.chunk(),
            handle,
            subpage.slot_ptr(handle.slot()),
            req_capacity,
            subpage.elem_size(),
            thread_cache,
        ))
    }
}
