//! # B-Tree Storage Engine
//!
//! A slotted, block-oriented B-tree with a `recency` timestamp on every
//! node. Leaf nodes hold key→value entries with per-entry write timestamps
//! (and tombstones); internal nodes hold separator-key→child pairs.
//!
//! ## The Recency Invariant
//!
//! Every node's recency is an upper bound on the modification time of
//! everything reachable below it:
//!
//! ```text
//! node.recency >= max(recency of every entry / subtree beneath it)
//! ```
//!
//! Every mutating operation maintains this by taking the superseding
//! (maximum) of the old and new timestamps. Backfill and replication rely
//! on it to skip whole subtrees that are provably unchanged since a given
//! point in time, so it is stamped *early* during descent (before any
//! structural change) to keep those windows tight.
//!
//! ## Navigation Convention
//!
//! Separators are closed on the left: for separator S, keys ≤ S descend
//! into the child to S's left, keys > S continue right. A split's median
//! separates the halves exactly: everything in the left node ≤ median <
//! everything in the right node.
//!
//! ## Balancing
//!
//! Internal nodes split *proactively* during descent (before they would
//! actually overflow); leaves split *reactively* once the specific incoming
//! value is known. Internal entries have a fixed worst-case size
//! (`MAX_KEY_SIZE` plus a slot), leaf entries do not until the value is in
//! hand. Underfull non-root nodes are merged with or leveled against a
//! sibling on the way down, so a traversal never needs to back up.
//!
//! ## Module Map
//!
//! - [`node`]: common block header (type, bounds, recency)
//! - [`sizer`]: value-sizer abstraction driving fullness predicates
//! - [`leaf`] / [`internal`]: slotted node layouts and primitive ops
//! - [`balance`]: split / merge / level state machine
//! - [`location`]: key-value location + apply-mutation
//! - [`traversal`]: write/read descent, scan, depth

pub mod balance;
pub mod internal;
pub mod leaf;
pub mod location;
pub mod node;
pub mod sizer;
pub mod traversal;

pub use balance::{CountingDeleter, NoopDeleter, ValueDeleter};
pub use internal::{InternalNode, InternalNodeMut, InternalSlot, INTERNAL_SLOT_SIZE};
pub use leaf::{extract_prefix, LeafNode, LeafNodeMut, LeafSlot, SearchResult, LEAF_SLOT_SIZE};
pub use location::{
    apply_keyvalue_change, DeleteMode, KeyModificationCallback, KeyValueLocation,
    ModificationProof, NoopModificationCallback,
};
pub use node::{NodeHeader, NodeType};
pub use sizer::{MaxBlockSizer, ValueSizer};
pub use traversal::{
    find_keyvalue_location_for_read, find_keyvalue_location_for_write, get, scan, tree_depth,
};

/// Owned separator key handed up from a split or leveling pass. Keys are
/// short (≤ `MAX_KEY_SIZE`) and most fit inline without a heap allocation.
pub type SeparatorKey = smallvec::SmallVec<[u8; 32]>;

/// Replication timestamp. Larger is more recent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Recency(pub u64);

impl Recency {
    pub const ZERO: Recency = Recency(0);

    /// The superseding (dominating) of two timestamps.
    #[inline]
    pub fn superseding(a: Recency, b: Recency) -> Recency {
        if a.0 >= b.0 {
            a
        } else {
            b
        }
    }
}
