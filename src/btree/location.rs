//! # Key-Value Location
//!
//! A [`KeyValueLocation`] is the result of a descent: the locked leaf the
//! key lives in (or would live in), whatever handle sits above it that a
//! structural change might need (the parent node, or the superblock when
//! the leaf is the root), and a copy of the current value.
//!
//! Mutation is two-phase. The caller first descends to get the location,
//! then calls [`apply_keyvalue_change`] with the new value. Before any
//! byte of the leaf changes, the registered [`KeyModificationCallback`] is
//! shown the old and new values and must return a [`ModificationProof`];
//! subsystems that maintain state derived from the tree (secondary
//! structures, change feeds) hook in there, and the proof makes skipping
//! them a type error rather than a silent bug.
//!
//! Deletions come in three flavors ([`DeleteMode`]): the regular path and
//! [`DeleteMode::MakeTombstone`] both leave a timestamped tombstone so the
//! deletion replicates; [`DeleteMode::Erase`] removes the entry without a
//! trace *and without stamping recency*, for housekeeping that must not
//! look like new activity to backfill.

use eyre::{bail, ensure, Result};
use tracing::trace;

use crate::btree::balance::{self, Parent, ValueDeleter};
use crate::btree::leaf::{leaf_cell_size, LeafNode, LeafNodeMut, SearchResult, LEAF_SLOT_SIZE};
use crate::btree::node::NodeHeader;
use crate::btree::sizer::ValueSizer;
use crate::btree::Recency;
use crate::buffer::{adjust_population, AccessMode, BlockId, BufCache, BufLock, Superblock};
use crate::buffer::NULL_BLOCK_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Ordinary deletion: leaves a tombstone.
    RegularQuery,
    /// Explicitly requested tombstone (backfill applying a remote delete).
    MakeTombstone,
    /// Physical removal, no tombstone, no recency stamp.
    Erase,
}

/// Token proving a [`KeyModificationCallback`] observed a pending change.
///
/// Constructed by callbacks once their side effects are in place;
/// [`apply_keyvalue_change`] will not touch the leaf without one.
#[must_use]
pub struct ModificationProof {
    _sealed: (),
}

impl ModificationProof {
    pub fn new() -> Self {
        Self { _sealed: () }
    }
}

impl Default for ModificationProof {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer invoked before a key's value changes.
pub trait KeyModificationCallback {
    /// `old` and `new` are `None` for absent-or-tombstone and deletion
    /// respectively.
    fn value_modified(
        &mut self,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<ModificationProof>;
}

pub struct NoopModificationCallback;

impl KeyModificationCallback for NoopModificationCallback {
    fn value_modified(
        &mut self,
        _key: &[u8],
        _old: Option<&[u8]>,
        _new: Option<&[u8]>,
    ) -> Result<ModificationProof> {
        Ok(ModificationProof::new())
    }
}

/// Where a key lives (or would live), with the locks a mutation needs.
pub struct KeyValueLocation {
    /// Held only when the leaf is the root: a root-leaf split or collapse
    /// repoints the superblock.
    pub superblock: Option<Superblock>,
    /// Write-locked parent, when the leaf is not the root. Needed for the
    /// post-delete underfull fix-up.
    pub parent: Option<BufLock>,
    pub leaf: Option<BufLock>,
    pub key: Vec<u8>,
    pub stat_block: BlockId,
    /// Whether a live (non-tombstone) value was present at descent time.
    pub there_originally_was_value: bool,
    /// Copy of the live value, if any.
    pub value: Option<Vec<u8>>,
}

/// Advances a node's recency (header and cache copy) to dominate
/// `timestamp`. Never moves it backwards.
pub(crate) fn stamp_recency(lock: &mut BufLock, timestamp: Recency) -> Result<()> {
    let header = NodeHeader::from_bytes_mut(lock.data_mut())?;
    header.set_node_recency(Recency::superseding(header.node_recency(), timestamp));
    lock.set_recency(Recency::superseding(lock.recency(), timestamp));
    Ok(())
}

/// Applies an insert/replace (`new_value` = Some) or a delete (`new_value`
/// = None) at a location obtained from a write descent. Returns whether
/// anything changed; deleting an absent key is not an error, just a no-op.
pub fn apply_keyvalue_change(
    cache: &BufCache,
    sizer: &dyn ValueSizer,
    deleter: &mut dyn ValueDeleter,
    callback: &mut dyn KeyModificationCallback,
    mut location: KeyValueLocation,
    new_value: Option<&[u8]>,
    timestamp: Recency,
    delete_mode: DeleteMode,
) -> Result<bool> {
    let mut leaf = match location.leaf.take() {
        Some(l) => l,
        None => bail!("apply on a location without a leaf"),
    };
    ensure!(
        leaf.mode() == AccessMode::Write,
        "apply through a read-mode location"
    );
    let key = location.key.clone();
    let old_value = location.value.take();

    let proof = callback.value_modified(&key, old_value.as_deref(), new_value)?;

    match new_value {
        Some(value) => {
            ensure!(
                value.len() <= sizer.max_value_size(),
                "value of {} bytes exceeds configured maximum {}",
                value.len(),
                sizer.max_value_size()
            );

            // replacing an entry reclaims its old cell, so only the net
            // growth has to fit
            let needed = {
                let view = LeafNode::from_block(leaf.data())?;
                let cost = sizer.leaf_entry_cost(&key, value);
                let credit = match view.find_key(&key) {
                    SearchResult::Found(i) => {
                        LEAF_SLOT_SIZE
                            + leaf_cell_size(key.len(), view.value_at(i)?.map(<[u8]>::len))
                    }
                    SearchResult::NotFound(_) => 0,
                };
                cost.saturating_sub(credit)
            };

            if !balance::node_fits(sizer, &leaf, needed)? {
                let parent = match (location.parent.as_mut(), location.superblock.as_mut()) {
                    (Some(p), _) => Parent::Node(p),
                    (None, Some(sb)) => Parent::Root(sb),
                    (None, None) => bail!("leaf split with no parent handle"),
                };
                if let Some((median, right)) =
                    balance::check_and_handle_split(cache, sizer, deleter, parent, &mut leaf, needed)?
                {
                    if key.as_slice() > median.as_slice() {
                        leaf = right;
                    }
                }
            }

            stamp_recency(&mut leaf, timestamp)?;
            {
                let _proof = proof;
                let mut view = LeafNodeMut::from_block(leaf.data_mut())?;
                view.insert_entry(&key, Some(value), timestamp)?;
            }
            trace!(key = ?key, leaf = leaf.block_id(), "wrote key");

            if let Some(old) = &old_value {
                deleter.delete_value(leaf.block_id(), &key, old)?;
            }
            if !location.there_originally_was_value {
                adjust_population(cache, location.stat_block, 1)?;
            }
            Ok(true)
        }
        None => {
            let had_live = location.there_originally_was_value;
            let changed = match delete_mode {
                DeleteMode::RegularQuery if !had_live => false,
                DeleteMode::RegularQuery | DeleteMode::MakeTombstone => {
                    // MakeTombstone is unconditional: backfill applies
                    // remote deletions over keys that were never present
                    // here. A fresh tombstone needs space of its own.
                    let needed = {
                        let view = LeafNode::from_block(leaf.data())?;
                        let cost = LEAF_SLOT_SIZE + leaf_cell_size(key.len(), None);
                        let credit = match view.find_key(&key) {
                            SearchResult::Found(i) => {
                                LEAF_SLOT_SIZE
                                    + leaf_cell_size(key.len(), view.value_at(i)?.map(<[u8]>::len))
                            }
                            SearchResult::NotFound(_) => 0,
                        };
                        cost.saturating_sub(credit)
                    };
                    if !balance::node_fits(sizer, &leaf, needed)? {
                        let parent = match (location.parent.as_mut(), location.superblock.as_mut())
                        {
                            (Some(p), _) => Parent::Node(p),
                            (None, Some(sb)) => Parent::Root(sb),
                            (None, None) => bail!("leaf split with no parent handle"),
                        };
                        if let Some((median, right)) = balance::check_and_handle_split(
                            cache, sizer, deleter, parent, &mut leaf, needed,
                        )? {
                            if key.as_slice() > median.as_slice() {
                                leaf = right;
                            }
                        }
                    }
                    stamp_recency(&mut leaf, timestamp)?;
                    let mut view = LeafNodeMut::from_block(leaf.data_mut())?;
                    view.make_tombstone(&key, timestamp)?;
                    true
                }
                DeleteMode::Erase => {
                    let mut view = LeafNodeMut::from_block(leaf.data_mut())?;
                    view.erase_key(&key)?
                }
            };
            drop(proof);

            if !changed {
                return Ok(false);
            }
            trace!(key = ?key, leaf = leaf.block_id(), mode = ?delete_mode, "deleted key");

            if let Some(old) = &old_value {
                deleter.delete_value(leaf.block_id(), &key, old)?;
            }
            if had_live {
                adjust_population(cache, location.stat_block, -1)?;
            }

            if let Some(parent) = location.parent.as_mut() {
                let fixed =
                    balance::check_and_handle_underfull(cache, sizer, deleter, parent, leaf, &key)?;
                drop(fixed);
            } else if LeafNode::from_block(leaf.data())?.entry_count() == 0 {
                // root leaf ran empty: shrink back to an empty tree
                if let Some(sb) = location.superblock.as_mut() {
                    sb.set_root(NULL_BLOCK_ID);
                    leaf.mark_deleted()?;
                }
            }
            Ok(true)
        }
    }
}
