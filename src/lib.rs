//! # chunkpool
//!
//! Pooled byte-buffer allocation over buddy-managed chunks. Each chunk is one
//! contiguous region carved up by a complete binary buddy tree whose per-node
//! state fits in a single byte; leaves are pages, and a leaf can be further
//! subdivided into fixed-size slots tracked by a bitmap subpage. Allocations
//! are named by a 64-bit handle encoding both the tree position and the slot.
//!
//! ## Features
//!
//! - **O(log n) best-fit runs**: page-multiple requests descend the tree to
//!   the leftmost node of the right depth; frees coalesce buddies on the way
//!   back up
//! - **Slab-style subpages**: sub-page requests share a leaf, one bitmap bit
//!   per slot, with per-element-size pools so partially filled leaves are
//!   reused across chunks
//! - **Compact handles**: `(node id, bitmap token)` packed into one `u64`
//! - **Bounded descriptor recycling**: spent buffer descriptors are kept in a
//!   small per-chunk cache and reused
//! - **Pluggable backing memory**: regions come from an [`Allocator`]
//!   implementation; the default uses the global allocator with huge-page
//!   friendly alignment
//!
//! ## Example
//!
//! ```rust
//! use chunkpool::{ChunkBuilder, SubpagePools, ThreadCacheId, normalize_capacity};
//!
//! # fn main() -> Result<(), chunkpool::ChunkError> {
//! // A 16 MiB chunk of 8 KiB pages, plus the shared subpage pools.
//! let mut chunk = ChunkBuilder::new().build()?;
//! let pools = SubpagePools::new(8192);
//! let cache = ThreadCacheId::default();
//!
//! // A run: two pages carved straight from the tree.
//! let big = chunk.allocate(&pools, 10_000, normalize_capacity(10_000), cache).unwrap();
//! assert_eq!(big.len(), 10_000);
//! assert_eq!(big.max_length(), 16_384);
//!
//! // A small allocation: one 128-byte slot of a subdivided leaf.
//! let small = chunk.allocate(&pools, 100, normalize_capacity(100), cache).unwrap();
//! assert_eq!(small.max_length(), 128);
//!
//! for buf in [big, small] {
//!     let handle = buf.handle();
//!     chunk.free(&pools, handle, Some(buf));
//! }
//! chunk.destroy(&pools);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! The allocator is synchronous and relies on external coarse locking: the
//! owning arena wraps every chunk in its own lock and calls the `&mut self`
//! methods under it. The per-element-size subpage pools carry one mutex per
//! bucket. A chunk takes at most one bucket mutex at a time and only inside
//! its exclusive borrow, and [`SubpagePools::allocate_pooled`] takes a bucket
//! mutex and nothing else, so lock acquisition follows a single global order
//! and cannot deadlock. Chunks must stay pinned in memory while any of their
//! allocations are live; descriptors and pooled subpages point back to them.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]

mod allocator;
mod arena;
mod buddy;
mod buffer;
mod chunk;
mod handle;
mod intrusive_list;
mod subpage;

pub use allocator::{Allocator, DefaultAllocator};
pub use arena::{normalize_capacity, SubpagePools, ThreadCacheId};
pub use buffer::PooledBuf;
pub use chunk::{
    Chunk, ChunkBuilder, ChunkError, DEFAULT_DESCRIPTOR_CACHE, DEFAULT_MAX_ORDER,
    DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE,
};
pub use handle::Handle;
