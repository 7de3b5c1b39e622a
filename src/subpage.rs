//! Leaf-level slab allocation.
//!
//! A subpage carves one leaf page into equal slots of a single element size
//! and tracks slot occupancy in a word bitmap. Subpages of the same element
//! size are chained into a pool list owned by the arena seam, so repeated
//! small requests can reuse a partially filled leaf instead of splitting a
//! fresh one off the tree.
//!
//! A subpage object is created the first time its leaf is used for small
//! allocation and then lives for the life of the chunk; when the leaf is
//! released back to the tree the object is merely unlinked, ready to be
//! re-initialised later, possibly for a different element size.

use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::handle::Handle;
use crate::intrusive_list::SubpageList;

/// Smallest element size a subpage can be carved into.
pub(crate) const MIN_ELEM_SIZE: usize = 16;

/// One leaf page subdivided into fixed-size slots.
pub struct Subpage {
    pub(crate) prev: Option<NonNull<Subpage>>,
    pub(crate) next: Option<NonNull<Subpage>>,

    chunk: NonNull<Chunk>,
    /// First byte of the leaf, resolved once so pooled allocation never has
    /// to reach back into the chunk.
    base: NonNull<u8>,
    leaf_id: u32,
    page_size: usize,

    elem_size: usize,
    max_num_elems: usize,
    bitmap: Box<[u64]>,
    bitmap_len: usize,
    /// Slot freed most recently, served before scanning the bitmap.
    next_avail: Option<u32>,
    num_avail: usize,
    do_not_destroy: bool,
}

// SAFETY: subpages are owned by their chunk's subpage table and mutated only
// under the bucket mutex of their element size (pooled path) or the chunk's
// exclusive borrow (chunk path); the raw pointers they carry stay valid for
// as long as the owning chunk is pinned.
unsafe impl Send for Subpage {}
unsafe impl Sync for Subpage {}

impl Subpage {
    /// Creates an unconfigured subpage for the given leaf.
    ///
    /// The bitmap is sized once for the smallest element size and reused by
    /// every later [`init`](Self::init).
    pub fn new(chunk: NonNull<Chunk>, base: NonNull<u8>, leaf_id: u32, page_size: usize) -> Self {
        let words = (page_size / MIN_ELEM_SIZE).div_ceil(64).max(1);
        Self {
            prev: None,
            next: None,
            chunk,
            base,
            leaf_id,
            page_size,
            elem_size: 0,
            max_num_elems: 0,
            bitmap: vec![0u64; words].into_boxed_slice(),
            bitmap_len: 0,
            next_avail: None,
            num_avail: 0,
            do_not_destroy: false,
        }
    }

    /// Configures the subpage for `elem_size` and splices it into `list`.
    ///
    /// Called on first use of the leaf and again whenever the leaf is
    /// re-acquired after having been released to the tree.
    pub fn init(&mut self, list: &mut SubpageList, elem_size: usize) {
        debug_assert!(elem_size.is_power_of_two());
        debug_assert!((MIN_ELEM_SIZE..self.page_size).contains(&elem_size));
        debug_assert!(!self.is_linked(), "re-initialising a pooled subpage");

        self.do_not_destroy = true;
        self.elem_size = elem_size;
        self.max_num_elems = self.page_size / elem_size;
        self.num_avail = self.max_num_elems;
        self.next_avail = Some(0);
        self.bitmap_len = self.max_num_elems.div_ceil(64);
        self.bitmap[..self.bitmap_len].fill(0);

        // SAFETY: self is owned by a chunk and not linked anywhere else.
        unsafe { list.push_front(NonNull::from(&mut *self)) };
    }

    /// Takes one free slot, returning its bitmap token.
    ///
    /// The token has [`Handle::SUBPAGE_BIT`] set so that slot 0 is still
    /// distinguishable from a run handle. Returns `None` when no slot is
    /// available or the subpage has been released.
    pub fn allocate(&mut self, list: &mut SubpageList) -> Option<u32> {
        if self.num_avail == 0 || !self.do_not_destroy {
            return None;
        }

        let slot = self.next_free_slot()?;
        let word = (slot >> 6) as usize;
        let mask = 1u64 << (slot & 63);
        debug_assert_eq!(self.bitmap[word] & mask, 0, "slot {slot} already taken");
        self.bitmap[word] |= mask;
        self.num_avail -= 1;

        if self.num_avail == 0 {
            // Fully occupied leaves leave the pool until a slot comes back.
            // SAFETY: we are linked in `list`; guarded by its bucket mutex.
            unsafe { list.remove(NonNull::from(&mut *self)) };
        }

        Some(Handle::subpage_token(slot))
    }

    /// Releases a slot.
    ///
    /// Returns `true` if the leaf must stay with this subpage, `false` if the
    /// subpage became empty and redundant, in which case the caller unwinds
    /// the leaf back into the buddy tree. An empty subpage that is the only
    /// pool member for its element size is kept, so a burst of small
    /// allocations does not thrash the tree.
    pub fn free(&mut self, list: &mut SubpageList, slot: u32) -> bool {
        debug_assert!((slot as usize) < self.max_num_elems, "slot {slot} out of range");

        let word = (slot >> 6) as usize;
        let mask = 1u64 << (slot & 63);
        debug_assert_ne!(self.bitmap[word] & mask, 0, "slot {slot} already free");
        self.bitmap[word] ^= mask;
        self.next_avail = Some(slot);
        self.num_avail += 1;

        if self.num_avail == 1 {
            // First slot back after being full: rejoin the pool.
            // SAFETY: self is valid and was unlinked when it filled up.
            unsafe { list.push_front(NonNull::from(&mut *self)) };
        }

        if self.num_avail != self.max_num_elems {
            return true;
        }

        if list.len() == 1 {
            // Keep the last subpage of this element size pooled.
            return true;
        }

        self.do_not_destroy = false;
        // SAFETY: self is linked (num_avail > 0 since the line above).
        unsafe { list.remove(NonNull::from(&mut *self)) };
        false
    }

    fn next_free_slot(&mut self) -> Option<u32> {
        if let Some(slot) = self.next_avail.take() {
            return Some(slot);
        }
        for (i, &word) in self.bitmap[..self.bitmap_len].iter().enumerate() {
            if word != u64::MAX {
                let slot = ((i as u32) << 6) | (!word).trailing_zeros();
                // The last word can have dead bits past max_num_elems.
                if (slot as usize) < self.max_num_elems {
                    return Some(slot);
                }
            }
        }
        None
    }

    /// Pointer to the first byte of a slot.
    #[must_use]
    pub fn slot_ptr(&self, slot: u32) -> NonNull<u8> {
        debug_assert!((slot as usize) < self.max_num_elems);
        // SAFETY: slot is within the leaf, so the offset stays in bounds of
        // the chunk's backing region.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(slot as usize * self.elem_size)) }
    }

    /// The chunk owning this subpage's leaf.
    #[must_use]
    pub fn chunk(&self) -> NonNull<Chunk> {
        self.chunk
    }

    /// Tree node id of the backing leaf.
    #[must_use]
    pub fn leaf_id(&self) -> u32 {
        self.leaf_id
    }

    /// Configured element size in bytes.
    #[must_use]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Slots currently free.
    #[must_use]
    #[allow(dead_code)] // Used in tests
    pub fn num_avail(&self) -> usize {
        self.num_avail
    }

    /// Total slots at the configured element size.
    #[must_use]
    #[allow(dead_code)] // Used in tests
    pub fn max_num_elems(&self) -> usize {
        self.max_num_elems
    }

    /// `false` once the subpage has been released back to the tree.
    #[must_use]
    pub fn do_not_destroy(&self) -> bool {
        self.do_not_destroy
    }

    /// Returns `true` while the subpage sits in its element-size pool.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }
}
