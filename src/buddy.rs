//! Byte-per-node buddy tree over one chunk.
//!
//! The chunk is modelled as a complete binary tree stored in a flat byte
//! array, heap style: the root lives at index 1, node `id` has children
//! `2 * id` and `2 * id + 1`, and the leaves at depth `max_order` each cover
//! one page. Two arrays describe the tree:
//!
//! - `depth_map[id]` is the depth of `id`, fixed at construction,
//! - `memory_map[id]` is the shallowest depth at which the subtree rooted at
//!   `id` still has a free node. `memory_map[id] == depth_map[id]` means the
//!   subtree is untouched; `memory_map[id] == max_order + 1` (the `unusable`
//!   sentinel) means it is fully allocated.
//!
//! Every mutation re-establishes the parent rule on the path to the root:
//! a parent holds the minimum of its children, except that two fully free
//! children coalesce the parent back to its own depth. The sentinel makes
//! `memory_map[1] > d` a complete test for "this chunk cannot satisfy a
//! request at depth `d`".

/// The buddy tree of one pooled chunk.
///
/// Node ids are `u32` and run over `[1, 2^(max_order + 1))`; index 0 is
/// unused. All depths are `u8` since `max_order` is bounded below 30.
pub struct BuddyTree {
    memory_map: Box<[u8]>,
    depth_map: Box<[u8]>,
    max_order: u8,
    unusable: u8,
    log2_chunk_size: u32,
}

impl BuddyTree {
    /// Builds a fully free tree for `page_size << max_order` bytes.
    ///
    /// `page_size` must be a power of two and `max_order < 30`; the chunk
    /// builder validates both before getting here.
    pub fn new(page_size: usize, max_order: u8) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(max_order < 30, "max order must be < 30, got {max_order}");

        let node_count = 1usize << (max_order + 1);
        let mut memory_map = vec![0u8; node_count].into_boxed_slice();
        let mut depth_map = vec![0u8; node_count].into_boxed_slice();

        let mut id = 1usize;
        for depth in 0..=max_order {
            for _ in 0..1usize << depth {
                memory_map[id] = depth;
                depth_map[id] = depth;
                id += 1;
            }
        }

        Self {
            memory_map,
            depth_map,
            max_order,
            unusable: max_order + 1,
            log2_chunk_size: page_size.trailing_zeros() + u32::from(max_order),
        }
    }

    /// Finds, marks and returns the leftmost free node at depth `depth`.
    ///
    /// Returns `None` when the chunk cannot satisfy the request, which is an
    /// ordinary outcome: the caller tries another chunk.
    pub fn allocate_node(&mut self, depth: u8) -> Option<u32> {
        debug_assert!(depth <= self.max_order, "depth {depth} out of range");

        if self.value(1) > depth {
            return None;
        }

        // Descend one level per iteration. The parent rule guarantees that
        // whenever the left child cannot serve the depth, the sibling can.
        let mut id = 1u32;
        for _ in 0..depth {
            id <<= 1;
            if self.value(id) > depth {
                id ^= 1;
            }
        }
        debug_assert_eq!(self.value(id), depth);
        debug_assert_eq!(self.depth_of(id), depth);

        self.set_value(id, self.unusable);
        self.update_parents_alloc(id);
        Some(id)
    }

    /// Returns a previously allocated node to the tree and coalesces upward.
    pub fn free_node(&mut self, id: u32) {
        debug_assert_eq!(
            self.value(id),
            self.unusable,
            "freeing node {id} that is not allocated"
        );
        self.set_value(id, self.depth_of(id));
        self.update_parents_free(id);
    }

    fn update_parents_alloc(&mut self, mut id: u32) {
        while id > 1 {
            let parent = id >> 1;
            let val = self.value(id).min(self.value(id ^ 1));
            self.set_value(parent, val);
            id = parent;
        }
    }

    fn update_parents_free(&mut self, mut id: u32) {
        // child_depth tracks the depth of the sibling pair being merged; it
        // shrinks by one per level as the walk moves toward the root.
        let mut child_depth = self.depth_of(id);
        while id > 1 {
            let parent = id >> 1;
            let left = self.value(id);
            let right = self.value(id ^ 1);
            if left == child_depth && right == child_depth {
                // Both subtrees fully free: the parent becomes directly
                // allocatable at its own depth again.
                self.set_value(parent, child_depth - 1);
            } else {
                self.set_value(parent, left.min(right));
            }
            id = parent;
            child_depth -= 1;
        }
    }

    /// Current `memory_map` value of a node.
    #[inline]
    #[must_use]
    pub fn value(&self, id: u32) -> u8 {
        self.memory_map[id as usize]
    }

    #[inline]
    fn set_value(&mut self, id: u32, val: u8) {
        self.memory_map[id as usize] = val;
    }

    /// Depth of a node, fixed at construction (root is 0).
    #[inline]
    #[must_use]
    pub fn depth_of(&self, id: u32) -> u8 {
        self.depth_map[id as usize]
    }

    /// Bytes covered by the subtree rooted at `id`.
    #[inline]
    #[must_use]
    pub fn run_length(&self, id: u32) -> usize {
        1 << (self.log2_chunk_size - u32::from(self.depth_of(id)))
    }

    /// Byte offset of the first byte covered by `id` within the chunk.
    #[inline]
    #[must_use]
    pub fn run_offset(&self, id: u32) -> usize {
        let shift = id ^ (1 << self.depth_of(id));
        shift as usize * self.run_length(id)
    }

    /// Depth of the leaves.
    #[inline]
    #[must_use]
    pub fn max_order(&self) -> u8 {
        self.max_order
    }

    /// The sentinel value marking a fully allocated subtree.
    #[inline]
    #[must_use]
    pub fn unusable(&self) -> u8 {
        self.unusable
    }

    /// Number of slots in the node arrays, including the unused index 0.
    #[inline]
    #[must_use]
    #[allow(dead_code)] // Used in tests
    pub fn node_count(&self) -> usize {
        self.memory_map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    /// Recomputes the expected `memory_map` top-down and compares.
    ///
    /// `allocated` holds the directly allocated node ids. Their descendants
    /// keep stale values on purpose (updates only walk toward the root), so
    /// the check does not descend into them. Everywhere else a parent whose
    /// children both sit at their own depth must sit at its own depth, and
    /// otherwise holds the minimum of the two.
    fn verify_node(tree: &BuddyTree, allocated: &HashSet<u32>, id: u32) -> u8 {
        let actual = tree.value(id);
        assert!(actual >= tree.depth_of(id) && actual <= tree.unusable());
        if allocated.contains(&id) {
            assert_eq!(actual, tree.unusable(), "node {id} should be allocated");
            return actual;
        }
        if tree.depth_of(id) == tree.max_order() {
            assert_eq!(actual, tree.depth_of(id), "leaf {id} should be free");
            return actual;
        }
        let left = verify_node(tree, allocated, id << 1);
        let right = verify_node(tree, allocated, (id << 1) | 1);
        let child_depth = tree.depth_of(id) + 1;
        let expected = if left == child_depth && right == child_depth {
            child_depth - 1
        } else {
            left.min(right)
        };
        assert_eq!(actual, expected, "parent {id} out of sync");
        expected
    }

    fn assert_tree_matches(tree: &BuddyTree, live: &[u32]) {
        verify_node(tree, &live.iter().copied().collect(), 1);
    }

    fn assert_fully_free(tree: &BuddyTree) {
        for id in 1..tree.node_count() as u32 {
            assert_eq!(tree.value(id), tree.depth_of(id), "node {id} not reset");
        }
    }

    #[test]
    fn fresh_tree_is_fully_free() {
        let tree = BuddyTree::new(8192, 11);
        assert_eq!(tree.node_count(), 4096);
        assert_eq!(tree.value(1), 0);
        assert_eq!(tree.unusable(), 12);
        assert_fully_free(&tree);
        assert_tree_matches(&tree, &[]);
    }

    #[test]
    fn geometry_matches_definition() {
        let tree = BuddyTree::new(8192, 11);
        // Root covers the whole 16 MiB chunk.
        assert_eq!(tree.run_length(1), 16 * 1024 * 1024);
        assert_eq!(tree.run_offset(1), 0);
        // Leaves cover one page each, left to right.
        assert_eq!(tree.depth_of(2048), 11);
        assert_eq!(tree.run_length(2048), 8192);
        assert_eq!(tree.run_offset(2048), 0);
        assert_eq!(tree.run_offset(2049), 8192);
        assert_eq!(tree.run_offset(4095), 16 * 1024 * 1024 - 8192);
        // An interior node.
        assert_eq!(tree.depth_of(5), 2);
        assert_eq!(tree.run_length(5), 4 * 1024 * 1024);
        assert_eq!(tree.run_offset(5), 4 * 1024 * 1024);
    }

    #[test]
    fn whole_chunk_allocates_exactly_once() {
        let mut tree = BuddyTree::new(8192, 4);
        assert_eq!(tree.allocate_node(0), Some(1));
        assert_eq!(tree.value(1), tree.unusable());
        assert_eq!(tree.allocate_node(4), None);
        assert_eq!(tree.allocate_node(0), None);

        tree.free_node(1);
        assert_fully_free(&tree);
        assert_eq!(tree.allocate_node(0), Some(1));
    }

    #[test]
    fn leaves_allocate_left_to_right_until_exhausted() {
        let mut tree = BuddyTree::new(8192, 4);
        for i in 0..16u32 {
            assert_eq!(tree.allocate_node(4), Some(16 + i));
        }
        assert_eq!(tree.value(1), tree.unusable());
        assert_eq!(tree.allocate_node(4), None);

        for id in 16..32u32 {
            tree.free_node(id);
        }
        assert_fully_free(&tree);
    }

    #[test]
    fn sibling_of_split_run_is_skipped() {
        let mut tree = BuddyTree::new(8192, 11);
        // One page, then a two-page run. The run cannot use node 1024 (its
        // left leaf is taken), so it lands on the sibling at 16 KiB.
        assert_eq!(tree.allocate_node(11), Some(2048));
        let run = tree.allocate_node(10).unwrap();
        assert_eq!(run, 1025);
        assert_eq!(tree.run_offset(run), 16 * 1024);
        assert_tree_matches(&tree, &[2048, 1025]);
    }

    #[test]
    fn coalescing_restores_the_parent_depth() {
        let mut tree = BuddyTree::new(8192, 4);
        let a = tree.allocate_node(4).unwrap();
        let b = tree.allocate_node(4).unwrap();
        assert_eq!(b, a ^ 1);

        // Parent is split while either leaf is live.
        assert_eq!(tree.value(a >> 1), tree.unusable());
        tree.free_node(a);
        assert_eq!(tree.value(a >> 1), tree.depth_of(a));
        assert_tree_matches(&tree, &[b]);

        // Once both are back, the pair is allocatable as one run.
        tree.free_node(b);
        assert_eq!(tree.value(a >> 1), tree.depth_of(a >> 1));
        assert_eq!(tree.allocate_node(3), Some(8));
    }

    #[test]
    fn partial_parent_still_serves_deeper_requests() {
        let mut tree = BuddyTree::new(8192, 4);
        let half = tree.allocate_node(1).unwrap();
        assert_eq!(half, 2);
        // The other half can still be carved into leaves.
        let mut live = vec![half];
        for _ in 0..8 {
            live.push(tree.allocate_node(4).unwrap());
        }
        assert_eq!(tree.allocate_node(4), None);
        assert_tree_matches(&tree, &live);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn parent_rule_survives_random_interleavings(
            ops in prop::collection::vec((0u8..=5, any::<bool>(), any::<u16>()), 1..256),
        ) {
            let mut tree = BuddyTree::new(64, 5);
            let mut live: Vec<u32> = Vec::new();

            for (depth, prefer_alloc, pick) in ops {
                if prefer_alloc || live.is_empty() {
                    if let Some(id) = tree.allocate_node(depth) {
                        live.push(id);
                    }
                } else {
                    let id = live.swap_remove(pick as usize % live.len());
                    tree.free_node(id);
                }
                assert_tree_matches(&tree, &live);
            }

            // Live runs never overlap.
            let mut ranges: Vec<(usize, usize)> = live
                .iter()
                .map(|&id| (tree.run_offset(id), tree.run_offset(id) + tree.run_length(id)))
                .collect();
            ranges.sort_unstable();
            for pair in ranges.windows(2) {
                assert!(pair[0].1 <= pair[1].0, "overlapping runs {pair:?}");
            }

            // Draining everything restores the initial state.
            for id in live {
                tree.free_node(id);
            }
            assert_fully_free(&tree);
        }
    }
}
