//! # Value Sizer
//!
//! Nodes are parameterized by a [`ValueSizer`] that knows the block size
//! and the worst-case entry size for the configured value type. Every
//! fullness decision in the tree goes through the predicates derived here,
//! so leaf layout code never hard-codes a capacity.
//!
//! ## Predicates
//!
//! - A **leaf is full** for a specific incoming entry when its free space
//!   cannot hold that entry's cell plus a slot. Leaves split reactively:
//!   the check runs with the actual value in hand.
//! - An **internal node is full** when its free space cannot hold a
//!   worst-case separator (`MAX_KEY_SIZE`) plus a slot. Internal nodes
//!   split proactively during descent, before they would overflow.
//! - A non-root node is **underfull** when its live usage drops below a
//!   quarter of the usable block space.
//! - Two siblings are **mergeable** when their combined usage (plus, for
//!   internal nodes, the separator demoted from the parent) fits within
//!   three quarters of one block, leaving headroom so the merged node is
//!   not immediately full again.

use crate::btree::leaf::{leaf_cell_size, LEAF_SLOT_SIZE};
use crate::btree::internal::INTERNAL_SLOT_SIZE;
use crate::config::{BLOCK_HEADER_SIZE, MAX_KEY_SIZE};

/// Sizing oracle for the configured value type.
pub trait ValueSizer {
    /// Block size nodes of this tree occupy.
    fn block_size(&self) -> usize;

    /// Bytes a value of this type occupies inside a leaf cell.
    fn size(&self, value: &[u8]) -> usize {
        value.len()
    }

    /// Upper bound on `size()` for any value of this type.
    fn max_value_size(&self) -> usize;

    /// Usable bytes per node (block minus the header).
    fn usable(&self) -> usize {
        self.block_size() - BLOCK_HEADER_SIZE
    }

    /// Space a specific key/value entry needs in a leaf, slot included.
    fn leaf_entry_cost(&self, key: &[u8], value: &[u8]) -> usize {
        LEAF_SLOT_SIZE + leaf_cell_size(key.len(), Some(self.size(value)))
    }

    /// Worst-case space one separator needs in an internal node.
    fn internal_entry_cost(&self) -> usize {
        INTERNAL_SLOT_SIZE + MAX_KEY_SIZE
    }

    /// Whether a non-root node with `used` live bytes needs merging or
    /// leveling.
    fn is_underfull(&self, used: usize) -> bool {
        used < self.usable() / 4
    }

    /// Whether two siblings with the given live usage can be merged into
    /// one node. `separator_cost` is nonzero for internal merges, where the
    /// parent's separator is demoted into the merged node.
    fn is_mergeable(&self, used_a: usize, used_b: usize, separator_cost: usize) -> bool {
        used_a + used_b + separator_cost <= self.usable() * 3 / 4
    }
}

/// Standard sizer: opaque byte values up to a fixed maximum.
#[derive(Debug, Clone, Copy)]
pub struct MaxBlockSizer {
    block_size: usize,
    max_value_size: usize,
}

impl MaxBlockSizer {
    pub fn new(block_size: usize, max_value_size: usize) -> Self {
        Self {
            block_size,
            max_value_size,
        }
    }
}

impl ValueSizer for MaxBlockSizer {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn max_value_size(&self) -> usize {
        self.max_value_size
    }
}
