//! # Tree Traversal
//!
//! ## Write Descent
//!
//! The write path holds at most two node write locks at a time: the node
//! being examined and its parent. The superblock counts as the root's
//! parent; it is released (or handed back to the caller through the
//! `pass_back_superblock` out-slot) as soon as the descent moves past the
//! root level, so superblock contention windows stay short. When the root
//! itself is the leaf, the superblock instead travels inside the returned
//! location, because applying the change may still have to split or
//! collapse the root.
//!
//! All rebalancing happens on the way down. Each internal node is
//! proactively split if it could not absorb one worst-case separator, and
//! repaired if underfull, before the descent enters it; by the time the
//! leaf is reached its parent is guaranteed to accommodate whatever the
//! leaf-level operation promotes or demotes, so nothing ever walks back
//! up. The root is exempt from the underfull check, but an internal root
//! left with zero separators is collapsed into its only child.
//!
//! Recency is stamped forward on every node the descent touches, *before*
//! any structural work at that node. Stamping early keeps the windows that
//! backfill computes from recency tight, and splits then copy the already
//! stamped value into both halves.
//!
//! ## Read Descent
//!
//! Reads take shared locks, release each ancestor as soon as the child is
//! held, never rebalance, and never stamp.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result};
use tracing::debug;

use crate::btree::balance::{self, Parent, ValueDeleter};
use crate::btree::internal::InternalNode;
use crate::btree::leaf::{LeafNode, LeafNodeMut, SearchResult};
use crate::btree::location::{stamp_recency, KeyValueLocation};
use crate::btree::node::{NodeHeader, NodeType};
use crate::btree::sizer::ValueSizer;
use crate::btree::Recency;
use crate::buffer::{AccessMode, BlockId, BufCache, BufLock, Superblock, NULL_BLOCK_ID};
use crate::config::MAX_KEY_SIZE;

static KEYS_READ: AtomicU64 = AtomicU64::new(0);
static KEYS_FOUND: AtomicU64 = AtomicU64::new(0);

/// Cumulative read-path counters, process-wide.
#[derive(Debug, Clone, Copy)]
pub struct ReadStats {
    pub keys_read: u64,
    pub keys_found: u64,
}

pub fn read_stats() -> ReadStats {
    ReadStats {
        keys_read: KEYS_READ.load(Ordering::Relaxed),
        keys_found: KEYS_FOUND.load(Ordering::Relaxed),
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    ensure!(!key.is_empty(), "empty key");
    ensure!(
        key.len() <= MAX_KEY_SIZE,
        "key of {} bytes exceeds maximum {}",
        key.len(),
        MAX_KEY_SIZE
    );
    Ok(())
}

fn node_type(lock: &BufLock) -> Result<NodeType> {
    Ok(NodeHeader::from_bytes(lock.data())?.node_type())
}

/// Descends to the leaf where `key` lives (or would live), write-locking
/// and rebalancing along the way. Creates the root leaf for an empty tree.
///
/// When the descent moves past the root level, the superblock is stored
/// into `pass_back_superblock` if provided, or released; a caller that
/// receives `None` in its slot will find the superblock retained inside
/// the location instead (the leaf was the root).
pub fn find_keyvalue_location_for_write(
    cache: &BufCache,
    sizer: &dyn ValueSizer,
    deleter: &mut dyn ValueDeleter,
    key: &[u8],
    timestamp: Recency,
    mut pass_back_superblock: Option<&mut Option<Superblock>>,
) -> Result<KeyValueLocation> {
    validate_key(key)?;
    let mut sb = Superblock::acquire(cache)?;
    let stat_block = sb.stat_block();

    let mut current = loop {
        let root_id = sb.root();
        if root_id == NULL_BLOCK_ID {
            let mut lock = cache.create()?;
            LeafNodeMut::init(lock.data_mut())?;
            sb.set_root(lock.block_id());
            debug!(root = lock.block_id(), "created root leaf");
            break lock;
        }

        let mut lock = cache.acquire(root_id, AccessMode::Write)?;
        if node_type(&lock)? == NodeType::Internal {
            let view = InternalNode::from_block(lock.data())?;
            if view.entry_count() == 0 {
                // internal root with a single child carries no information
                let only_child = view.right_child();
                lock.detach_child(only_child);
                sb.set_root(only_child);
                lock.mark_deleted()?;
                debug!(root = only_child, "collapsed empty internal root");
                continue;
            }
        }
        break lock;
    };

    stamp_recency(&mut current, timestamp)?;

    if node_type(&current)? == NodeType::Internal {
        if let Some((median, right)) = balance::check_and_handle_split(
            cache,
            sizer,
            deleter,
            Parent::Root(&mut sb),
            &mut current,
            sizer.internal_entry_cost(),
        )? {
            if key > median.as_slice() {
                current = right;
            }
        }
    }

    let mut superblock = Some(sb);
    let mut parent: Option<BufLock> = None;

    loop {
        if node_type(&current)? == NodeType::Leaf {
            break;
        }

        // past the root level: the superblock can go
        if let Some(sb) = superblock.take() {
            if let Some(slot) = pass_back_superblock.as_mut() {
                **slot = Some(sb);
            }
        }

        let child_id = InternalNode::from_block(current.data())?.find_child(key)?;
        let mut child = cache.acquire(child_id, AccessMode::Write)?;
        stamp_recency(&mut child, timestamp)?;

        if node_type(&child)? == NodeType::Internal {
            if let Some((median, right)) = balance::check_and_handle_split(
                cache,
                sizer,
                deleter,
                Parent::Node(&mut current),
                &mut child,
                sizer.internal_entry_cost(),
            )? {
                if key > median.as_slice() {
                    child = right;
                }
            }
            child = balance::check_and_handle_underfull(cache, sizer, deleter, &mut current, child, key)?;
            // release the grandparent-to-be
            current = child;
        } else {
            parent = Some(current);
            current = child;
        }
    }

    let view = LeafNode::from_block(current.data())?;
    let (there_originally_was_value, value) = match view.find_key(key) {
        SearchResult::Found(i) => match view.value_at(i)? {
            Some(v) => (true, Some(v.to_vec())),
            None => (false, None),
        },
        SearchResult::NotFound(_) => (false, None),
    };

    Ok(KeyValueLocation {
        superblock,
        parent,
        leaf: Some(current),
        key: key.to_vec(),
        stat_block,
        there_originally_was_value,
        value,
    })
}

/// Read-only descent. The returned location has no leaf when the tree is
/// empty; it carries no superblock or parent.
pub fn find_keyvalue_location_for_read(cache: &BufCache, key: &[u8]) -> Result<KeyValueLocation> {
    validate_key(key)?;
    KEYS_READ.fetch_add(1, Ordering::Relaxed);

    let sb = Superblock::acquire_read(cache)?;
    let stat_block = sb.stat_block();
    let root_id = sb.root();

    let empty = |stat_block| KeyValueLocation {
        superblock: None,
        parent: None,
        leaf: None,
        key: key.to_vec(),
        stat_block,
        there_originally_was_value: false,
        value: None,
    };

    if root_id == NULL_BLOCK_ID {
        return Ok(empty(stat_block));
    }

    let mut current = cache.acquire(root_id, AccessMode::Read)?;
    drop(sb);

    while node_type(&current)? == NodeType::Internal {
        let child_id = InternalNode::from_block(current.data())?.find_child(key)?;
        current = cache.acquire(child_id, AccessMode::Read)?;
    }

    let view = LeafNode::from_block(current.data())?;
    let (there_originally_was_value, value) = match view.find_key(key) {
        SearchResult::Found(i) => match view.value_at(i)? {
            Some(v) => (true, Some(v.to_vec())),
            None => (false, None),
        },
        SearchResult::NotFound(_) => (false, None),
    };
    if there_originally_was_value {
        KEYS_FOUND.fetch_add(1, Ordering::Relaxed);
    }

    Ok(KeyValueLocation {
        superblock: None,
        parent: None,
        leaf: Some(current),
        key: key.to_vec(),
        stat_block,
        there_originally_was_value,
        value,
    })
}

/// Point lookup. `None` for absent keys and tombstones alike.
pub fn get(cache: &BufCache, key: &[u8]) -> Result<Option<Vec<u8>>> {
    Ok(find_keyvalue_location_for_read(cache, key)?.value)
}

/// In-order snapshot of every live entry. Backfill-style full walk; holds
/// read locks down the current path while recursing.
pub fn scan(cache: &BufCache) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let sb = Superblock::acquire_read(cache)?;
    let root_id = sb.root();
    drop(sb);

    let mut out = Vec::new();
    if root_id != NULL_BLOCK_ID {
        scan_node(cache, root_id, &mut out)?;
    }
    Ok(out)
}

fn scan_node(cache: &BufCache, id: BlockId, out: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
    let lock = cache.acquire(id, AccessMode::Read)?;
    match node_type(&lock)? {
        NodeType::Leaf => {
            let view = LeafNode::from_block(lock.data())?;
            for i in 0..view.entry_count() as usize {
                if let Some(value) = view.value_at(i)? {
                    out.push((view.key_at(i)?.to_vec(), value.to_vec()));
                }
            }
        }
        NodeType::Internal => {
            let children = InternalNode::from_block(lock.data())?.children()?;
            for child in children {
                scan_node(cache, child, out)?;
            }
        }
        NodeType::Unknown => eyre::bail!("scan hit unformatted block {}", id),
    }
    Ok(())
}

/// Root-to-leaf level count. Zero for an empty tree.
pub fn tree_depth(cache: &BufCache) -> Result<usize> {
    let sb = Superblock::acquire_read(cache)?;
    let mut id = sb.root();
    drop(sb);

    let mut depth = 0;
    while id != NULL_BLOCK_ID {
        let lock = cache.acquire(id, AccessMode::Read)?;
        depth += 1;
        id = match node_type(&lock)? {
            NodeType::Leaf => NULL_BLOCK_ID,
            NodeType::Internal => {
                let view = InternalNode::from_block(lock.data())?;
                if view.entry_count() > 0 {
                    view.child_at(0)?
                } else {
                    view.right_child()
                }
            }
            NodeType::Unknown => eyre::bail!("depth probe hit unformatted block {}", id),
        };
    }
    Ok(depth)
}
