//! Chunk orchestration.
//!
//! A [`Chunk`] owns one contiguous backing region and routes every request by
//! size: page-multiple capacities become runs carved from the buddy tree,
//! smaller ones become slots inside a subpage carved from a single leaf. Both
//! paths end in the same 64-bit [`Handle`], and [`Chunk::init_buf`] is the
//! one place a handle is projected back into a pointer/length view.
//!
//! The chunk performs no locking of its own for tree state: the arena wraps
//! each chunk in its coarse lock and hands `&mut Chunk` in. Only the subpage
//! pool buckets carry real mutexes, and a chunk takes at most one of them at
//! a time, inside the exclusive borrow, so the acquisition order is total.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, trace};
use thiserror::Error;

use crate::allocator::{Allocator, DefaultAllocator};
use crate::arena::{SubpagePools, ThreadCacheId};
use crate::buddy::BuddyTree;
use crate::buffer::PooledBuf;
use crate::handle::Handle;
use crate::subpage::Subpage;

/// Smallest page size a chunk can be built with.
pub const MIN_PAGE_SIZE: usize = 16;

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Default tree depth, giving 16 MiB chunks at the default page size.
pub const DEFAULT_MAX_ORDER: u8 = 11;

/// Default bound on recycled descriptor shells kept per chunk.
pub const DEFAULT_DESCRIPTOR_CACHE: usize = 1023;

/// Errors raised while constructing a chunk.
///
/// Running out of pool capacity is not an error: `allocate` signals that with
/// `None` and the arena simply tries elsewhere.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The page size was not a power of two of at least [`MIN_PAGE_SIZE`].
    #[error("page size must be a power of two of at least {MIN_PAGE_SIZE}, got {0}")]
    InvalidPageSize(usize),

    /// The tree depth was out of range.
    #[error("max order must be below 30, got {0}")]
    InvalidMaxOrder(u8),

    /// `page_size << max_order` does not fit the address space.
    #[error("chunk geometry {page_size} * 2^{max_order} exceeds the address space")]
    GeometryOverflow {
        /// Requested page size.
        page_size: usize,
        /// Requested tree depth.
        max_order: u8,
    },

    /// The backing region could not be provided.
    #[error("backing region allocation failed")]
    Backing(#[from] std::io::Error),
}

/// Configures and mints chunks.
///
/// One builder can produce any number of chunks sharing the same geometry and
/// region provider, which is how an arena grows.
///
/// ```
/// use chunkpool::{ChunkBuilder, SubpagePools, ThreadCacheId};
///
/// # fn main() -> Result<(), chunkpool::ChunkError> {
/// let mut chunk = ChunkBuilder::new().page_size(4096).max_order(4).build()?;
/// let pools = SubpagePools::new(4096);
///
/// let buf = chunk
///     .allocate(&pools, 4096, 4096, ThreadCacheId::default())
///     .unwrap();
/// let handle = buf.handle();
/// chunk.free(&pools, handle, Some(buf));
/// # Ok(())
/// # }
/// ```
pub struct ChunkBuilder {
    page_size: usize,
    max_order: u8,
    offset: usize,
    descriptor_cache: usize,
    allocator: Arc<dyn Allocator>,
}

impl Default for ChunkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkBuilder {
    /// Creates a builder with the default geometry: 8 KiB pages, order 11
    /// (16 MiB chunks), no offset, [`DefaultAllocator`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_order: DEFAULT_MAX_ORDER,
            offset: 0,
            descriptor_cache: DEFAULT_DESCRIPTOR_CACHE,
            allocator: Arc::new(DefaultAllocator::new()),
        }
    }

    /// Sets the leaf granularity. Must be a power of two, at least 16.
    #[must_use]
    pub const fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the tree depth. Chunk size is `page_size << max_order`.
    #[must_use]
    pub const fn max_order(mut self, max_order: u8) -> Self {
        self.max_order = max_order;
        self
    }

    /// Reserves `offset` bytes at the front of the backing region; user data
    /// starts after them.
    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Bounds how many spent descriptor shells a chunk keeps for reuse.
    /// Shells returned past the bound are silently dropped.
    #[must_use]
    pub const fn descriptor_cache(mut self, bound: usize) -> Self {
        self.descriptor_cache = bound;
        self
    }

    /// Substitutes the backing-region provider.
    #[must_use]
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Builds a pooled chunk: full tree, subpage table, accounting.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError`] when the geometry is invalid or the backing
    /// region cannot be allocated.
    pub fn build(&self) -> Result<Chunk, ChunkError> {
        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            return Err(ChunkError::InvalidPageSize(self.page_size));
        }
        if self.max_order >= 30 {
            return Err(ChunkError::InvalidMaxOrder(self.max_order));
        }
        let chunk_size = self
            .page_size
            .checked_mul(1usize << self.max_order)
            .ok_or(ChunkError::GeometryOverflow {
                page_size: self.page_size,
                max_order: self.max_order,
            })?;

        let memory = self.allocator.allocate(chunk_size + self.offset)?;
        debug!(
            "pooled chunk created: {} bytes, {}-byte pages, order {}",
            chunk_size, self.page_size, self.max_order
        );
        Ok(Chunk {
            memory,
            chunk_size,
            offset: self.offset,
            allocator: Arc::clone(&self.allocator),
            list_index: None,
            pool: Some(PoolState::new(
                self.page_size,
                self.max_order,
                self.descriptor_cache,
            )),
        })
    }

    /// Builds an unpooled chunk of arbitrary `size`: no tree, no subpages, no
    /// accounting. Only destruction is meaningful; the arena uses these to
    /// hand out oversized buffers through the same descriptor type.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Backing`] when the region cannot be allocated.
    pub fn build_unpooled(&self, size: usize) -> Result<Chunk, ChunkError> {
        let memory = self.allocator.allocate(size + self.offset)?;
        debug!("unpooled chunk created: {size} bytes");
        Ok(Chunk {
            memory,
            chunk_size: size,
            offset: self.offset,
            allocator: Arc::clone(&self.allocator),
            list_index: None,
            pool: None,
        })
    }
}

/// Everything a pooled chunk tracks beyond its raw region.
struct PoolState {
    tree: BuddyTree,
    page_size: usize,
    page_shifts: u32,
    max_subpage_allocs: u32,
    subpages: Box<[Option<Box<Subpage>>]>,
    free_bytes: usize,
    spare_bufs: VecDeque<PooledBuf>,
    spare_bound: usize,
}

impl PoolState {
    fn new(page_size: usize, max_order: u8, spare_bound: usize) -> Self {
        let max_subpage_allocs = 1u32 << max_order;
        Self {
            tree: BuddyTree::new(page_size, max_order),
            page_size,
            page_shifts: page_size.trailing_zeros(),
            max_subpage_allocs,
            subpages: (0..max_subpage_allocs).map(|_| None).collect(),
            free_bytes: page_size << max_order,
            spare_bufs: VecDeque::with_capacity(8),
            spare_bound,
        }
    }

    fn subpage_idx(&self, node_id: u32) -> usize {
        (node_id ^ self.max_subpage_allocs) as usize
    }
}

/// One contiguous backing region managed as a buddy tree of pages.
///
/// All mutating methods take `&mut self`: the arena provides that exclusivity
/// by keeping each chunk behind its own lock. A chunk must stay pinned (the
/// arena stores it boxed or otherwise immovable) while any of its allocations
/// or subpages are live, because descriptors and pooled subpages carry raw
/// pointers back to it.
///
/// A chunk whose subpages are still linked into [`SubpagePools`] must be torn
/// down with [`destroy`](Chunk::destroy), not dropped directly.
pub struct Chunk {
    memory: NonNull<u8>,
    chunk_size: usize,
    offset: usize,
    allocator: Arc<dyn Allocator>,
    /// Slot in the arena's chunk table; the arena keeps it current as it
    /// moves the chunk between occupancy lists.
    list_index: Option<usize>,
    pool: Option<PoolState>,
}

// SAFETY: the raw region pointer is owned by this chunk alone; subpages and
// their list links are only touched under the documented lock discipline.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Allocates `norm_capacity` bytes and projects the result into a buffer
    /// descriptor of `req_capacity` visible bytes.
    ///
    /// `norm_capacity` must be normalised (a power of two, at least 16, see
    /// [`normalize_capacity`](crate::normalize_capacity)) and `req_capacity`
    /// must not exceed it. Returns `None` when this chunk cannot satisfy the
    /// request; nothing is consumed in that case.
    pub fn allocate(
        &mut self,
        pools: &SubpagePools,
        req_capacity: usize,
        norm_capacity: usize,
        thread_cache: ThreadCacheId,
    ) -> Option<PooledBuf> {
        debug_assert!(self.pool.is_some(), "allocate on an unpooled chunk");
        debug_assert!(norm_capacity.is_power_of_two());
        debug_assert!(req_capacity <= norm_capacity);

        let pool = self.pool.as_ref()?;
        if norm_capacity > self.chunk_size {
            return None;
        }
        let is_run = norm_capacity & !(pool.page_size - 1) != 0;

        let handle = if is_run {
            self.allocate_run(norm_capacity)
        } else {
            self.allocate_subpage(pools, norm_capacity)
        }?;

        let shell = self.pool.as_mut().and_then(|p| p.spare_bufs.pop_back());
        Some(self.project(shell, handle, req_capacity, thread_cache))
    }

    /// Run path: one node at the depth whose runs are `norm_capacity` long.
    fn allocate_run(&mut self, norm_capacity: usize) -> Option<Handle> {
        let pool = self.pool.as_mut().unwrap();
        let depth =
            pool.tree.max_order() - (norm_capacity.trailing_zeros() - pool.page_shifts) as u8;
        let id = pool.tree.allocate_node(depth)?;
        pool.free_bytes -= pool.tree.run_length(id);
        Some(Handle::encode(id, 0))
    }

    /// Subpage path: split a fresh leaf and take its first slot.
    ///
    /// Reuse of partially filled leaves happens one layer up, in
    /// [`SubpagePools::allocate_pooled`]; by the time a request reaches the
    /// chunk the pool for this element size was empty.
    fn allocate_subpage(&mut self, pools: &SubpagePools, norm_capacity: usize) -> Option<Handle> {
        let chunk_ptr = NonNull::from(&mut *self);
        let memory = self.memory;
        let region_offset = self.offset;

        let mut list = pools.pool_head(norm_capacity).lock();
        let pool = self.pool.as_mut().unwrap();
        let page_size = pool.page_size;

        let id = pool.tree.allocate_node(pool.tree.max_order())?;
        pool.free_bytes -= page_size;
        trace!("leaf {id} split into {norm_capacity}-byte slots");

        let leaf_base = {
            let off = region_offset + pool.tree.run_offset(id);
            // SAFETY: the leaf lies inside the backing region.
            unsafe { NonNull::new_unchecked(memory.as_ptr().add(off)) }
        };

        let sp_idx = pool.subpage_idx(id);
        let subpage = pool.subpages[sp_idx]
            .get_or_insert_with(|| Box::new(Subpage::new(chunk_ptr, leaf_base, id, page_size)));
        subpage.init(&mut list, norm_capacity);

        let token = subpage.allocate(&mut list);
        debug_assert!(token.is_some(), "fresh subpage must have a free slot");
        Some(Handle::encode(id, token?))
    }

    /// Releases the allocation named by `handle`.
    ///
    /// Subpage handles may leave the leaf in place when other slots are still
    /// live or the subpage is kept pooled; run handles (and released leaves)
    /// go back into the tree. A spent descriptor passed as `recycled` is kept
    /// for reuse while the shell cache is below its bound.
    pub fn free(&mut self, pools: &SubpagePools, handle: Handle, recycled: Option<PooledBuf>) {
        debug_assert!(self.pool.is_some(), "free on an unpooled chunk");
        let Some(pool) = self.pool.as_mut() else {
            return;
        };

        let node = handle.node_id();
        if handle.is_subpage() {
            let sp_idx = pool.subpage_idx(node);
            let Some(subpage) = pool.subpages[sp_idx].as_deref_mut() else {
                debug_assert!(false, "subpage handle {handle:?} without a subpage");
                return;
            };
            debug_assert!(subpage.do_not_destroy());

            let mut list = pools.pool_head(subpage.elem_size()).lock();
            if subpage.free(&mut list, handle.slot()) {
                return;
            }
            drop(list);
            trace!("leaf {node} released back to the tree");
        }

        pool.free_bytes += pool.tree.run_length(node);
        pool.tree.free_node(node);

        if let Some(buf) = recycled {
            if pool.spare_bufs.len() < pool.spare_bound {
                pool.spare_bufs.push_back(buf);
            }
        }
    }

    /// Re-projects an existing handle into a buffer descriptor without
    /// allocating, e.g. when the arena serves a handle out of a thread cache.
    pub fn init_buf(
        &mut self,
        handle: Handle,
        req_capacity: usize,
        thread_cache: ThreadCacheId,
    ) -> PooledBuf {
        let shell = self.pool.as_mut().and_then(|p| p.spare_bufs.pop_back());
        self.project(shell, handle, req_capacity, thread_cache)
    }

    /// The single point where a handle becomes a (pointer, length) view.
    fn project(
        &mut self,
        shell: Option<PooledBuf>,
        handle: Handle,
        req_capacity: usize,
        thread_cache: ThreadCacheId,
    ) -> PooledBuf {
        let chunk_ptr = NonNull::from(&mut *self);
        let pool = self.pool.as_ref().unwrap();
        let node = handle.node_id();

        let (data_offset, max_length) = if handle.is_subpage() {
            let subpage = pool.subpages[pool.subpage_idx(node)].as_deref().unwrap();
            debug_assert!(subpage.do_not_destroy());
            debug_assert!(req_capacity <= subpage.elem_size());
            (
                pool.tree.run_offset(node) + handle.slot() as usize * subpage.elem_size(),
                subpage.elem_size(),
            )
        } else {
            debug_assert_eq!(pool.tree.value(node), pool.tree.unusable());
            (pool.tree.run_offset(node), pool.tree.run_length(node))
        };

        // SAFETY: the projection stays inside the backing region.
        let ptr = unsafe {
            NonNull::new_unchecked(self.memory.as_ptr().add(self.offset + data_offset))
        };
        match shell {
            Some(mut buf) => {
                buf.reinit(chunk_ptr, handle, ptr, req_capacity, max_length, thread_cache);
                buf
            }
            None => PooledBuf::new(chunk_ptr, handle, ptr, req_capacity, max_length, thread_cache),
        }
    }

    /// Percentage of the chunk in use, in `[0, 100]`.
    ///
    /// A chunk with any allocation at all reports at least 1, and a chunk
    /// with less than one percent free reports 99; only a byte-exact full
    /// chunk reports 100. Unpooled chunks are always 100.
    #[must_use]
    pub fn usage(&self) -> u8 {
        let Some(pool) = self.pool.as_ref() else {
            return 100;
        };
        if pool.free_bytes == 0 {
            return 100;
        }
        let free_percentage = (pool.free_bytes as u64 * 100 / self.chunk_size as u64) as u8;
        if free_percentage == 0 {
            return 99;
        }
        100 - free_percentage
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes not currently charged to any allocation. Always 0 for unpooled
    /// chunks.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.free_bytes)
    }

    /// Returns `false` for the unpooled variant.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Arena-owned chunk-table slot, if the arena has assigned one.
    #[must_use]
    pub fn list_index(&self) -> Option<usize> {
        self.list_index
    }

    /// Records the arena-owned chunk-table slot.
    pub fn set_list_index(&mut self, index: Option<usize>) {
        self.list_index = index;
    }

    /// Tears the chunk down, unlinking any subpages still sitting in the
    /// pools, and releases the backing region.
    pub fn destroy(mut self, pools: &SubpagePools) {
        if let Some(pool) = self.pool.as_mut() {
            for slot in &mut *pool.subpages {
                if let Some(subpage) = slot.as_deref_mut() {
                    if subpage.is_linked() {
                        let mut list = pools.pool_head(subpage.elem_size()).lock();
                        // SAFETY: the subpage is linked in exactly this
                        // bucket; the lock is held.
                        unsafe { list.remove(NonNull::from(&mut *subpage)) };
                    }
                }
            }
        }
        debug!("chunk destroyed: {} bytes", self.chunk_size);
        drop(self);
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            debug_assert!(
                pool.subpages.iter().flatten().all(|sp| !sp.is_linked()),
                "chunk dropped while subpages are pooled; use destroy()"
            );
        }
        // SAFETY: the region came from this provider with this exact size.
        unsafe {
            self.allocator
                .deallocate(self.memory, self.chunk_size + self.offset);
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("chunk_size", &self.chunk_size)
            .field("free_bytes", &self.free_bytes())
            .field("usage", &self.usage())
            .field("pooled", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}
