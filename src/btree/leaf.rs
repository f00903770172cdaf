//! # Leaf Node Layout
//!
//! Leaf nodes store the actual key→value entries, each with its own write
//! timestamp, plus tombstones recording deletions for replication. All key
//! and value reads return slices pointing directly into the block buffer.
//!
//! ## Slot Array
//!
//! ```text
//! LeafSlot (8 bytes):
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |      prefix (4 bytes)             | offset (2B)     | key_len (2B)    |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! - **prefix**: first 4 bytes of the key, compared as a big-endian u32 so
//!   integer comparison matches lexicographic byte order
//! - **offset**: cell content offset within the block
//! - **key_len**: full key length
//!
//! ## Cell Content
//!
//! Cells grow upward from the block end:
//!
//! ```text
//! +------------------+------------------+----------------+---------------+
//! | key (key_len B)  | timestamp (8B LE)| value_len (2B) | value (N B)   |
//! +------------------+------------------+----------------+---------------+
//! ```
//!
//! `value_len == 0xFFFF` marks a tombstone: the key was deleted at
//! `timestamp` and the cell carries no value bytes. Tombstones participate
//! in search and rebalancing like live entries; they are what backfill
//! replays to propagate deletions.
//!
//! ## Fragmentation
//!
//! Deleting a slot strands its cell bytes. No fragment counter is kept;
//! instead, an insert that fails the free-space check but would fit after
//! reclaiming stranded bytes triggers compaction and retries. Compaction
//! rewrites all live cells contiguously from the block end.
//!
//! ## Block Size
//!
//! Unlike a fixed-page layout, leaf views carry no compile-time size: a
//! node occupies whatever block size its tree's value sizer configured, so
//! the same code serves 512-byte test trees and 32 KiB production trees.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use eyre::{ensure, Result};
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::node::{NodeHeader, NodeType};
use crate::btree::{Recency, SeparatorKey};
use crate::config::{BLOCK_HEADER_SIZE, MAX_KEY_SIZE};

pub const LEAF_SLOT_SIZE: usize = 8;

/// Timestamp + value_len bytes that follow the key in every cell.
const CELL_FIXED_OVERHEAD: usize = 8 + 2;

/// value_len sentinel marking a tombstone cell.
const TOMBSTONE_LEN: u16 = 0xFFFF;

/// Largest storable value. One below the tombstone sentinel.
pub const MAX_LEAF_VALUE_SIZE: usize = TOMBSTONE_LEN as usize - 1;

/// Bytes a cell occupies. `value_size` is `None` for a tombstone.
#[inline]
pub fn leaf_cell_size(key_len: usize, value_size: Option<usize>) -> usize {
    key_len + CELL_FIXED_OVERHEAD + value_size.unwrap_or(0)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct LeafSlot {
    pub prefix: [u8; 4],
    pub offset: U16,
    pub key_len: U16,
}

impl LeafSlot {
    pub fn new(key: &[u8], offset: u16) -> Self {
        Self {
            prefix: extract_prefix(key),
            offset: U16::new(offset),
            key_len: U16::new(key.len() as u16),
        }
    }

    pub fn prefix_as_u32(&self) -> u32 {
        u32::from_be_bytes(self.prefix)
    }
}

pub fn extract_prefix(key: &[u8]) -> [u8; 4] {
    let mut prefix = [0u8; 4];
    let len = key.len().min(4);
    prefix[..len].copy_from_slice(&key[..len]);
    prefix
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key present (live entry or tombstone) at this slot index.
    Found(usize),
    /// Key absent; this is its insertion position.
    NotFound(usize),
}

/// One decoded leaf entry. Used by rebalancing to shuttle entries through
/// an arena while nodes are rewritten.
#[derive(Debug, Clone, Copy)]
pub struct LeafEntry<'a> {
    pub key: &'a [u8],
    pub timestamp: Recency,
    /// `None` for a tombstone.
    pub value: Option<&'a [u8]>,
}

impl LeafEntry<'_> {
    pub fn cell_size(&self) -> usize {
        leaf_cell_size(self.key.len(), self.value.map(<[u8]>::len))
    }

    pub fn cost(&self) -> usize {
        LEAF_SLOT_SIZE + self.cell_size()
    }
}

#[derive(Debug)]
pub struct LeafNode<'a> {
    data: &'a [u8],
}

pub struct LeafNodeMut<'a> {
    data: &'a mut [u8],
}

fn validate_leaf(data: &[u8]) -> Result<()> {
    let header = NodeHeader::from_bytes(data)?;
    ensure!(
        header.node_type() == NodeType::Leaf,
        "expected Leaf block, got {:?}",
        header.node_type()
    );
    ensure!(
        header.free_end() as usize <= data.len(),
        "leaf free_end {} beyond block of {} bytes",
        header.free_end(),
        data.len()
    );
    Ok(())
}

macro_rules! leaf_read_impl {
    () => {
        pub fn entry_count(&self) -> u16 {
            let header = NodeHeader::from_bytes(self.data).unwrap();
            header.entry_count()
        }

        pub fn recency(&self) -> Recency {
            let header = NodeHeader::from_bytes(self.data).unwrap();
            header.node_recency()
        }

        pub fn free_space(&self) -> usize {
            let header = NodeHeader::from_bytes(self.data).unwrap();
            (header.free_end() - header.free_start()) as usize
        }

        fn slot_offset(&self, index: usize) -> usize {
            BLOCK_HEADER_SIZE + index * LEAF_SLOT_SIZE
        }

        pub fn slot_at(&self, index: usize) -> Result<&LeafSlot> {
            ensure!(
                index < self.entry_count() as usize,
                "slot index {} out of bounds (entry_count={})",
                index,
                self.entry_count()
            );
            let offset = self.slot_offset(index);
            LeafSlot::ref_from_bytes(&self.data[offset..offset + LEAF_SLOT_SIZE])
                .map_err(|e| eyre::eyre!("failed to read leaf slot at index {}: {:?}", index, e))
        }

        /// (key, timestamp, value) for the cell at `index`. Zero-copy.
        fn cell_at(&self, index: usize) -> Result<(&[u8], Recency, Option<&[u8]>)> {
            let slot = self.slot_at(index)?;
            let cell_offset = slot.offset.get() as usize;
            let key_len = slot.key_len.get() as usize;
            let fixed_end = cell_offset + key_len + CELL_FIXED_OVERHEAD;
            ensure!(
                fixed_end <= self.data.len(),
                "cell extends beyond block: offset={}, key_len={}",
                cell_offset,
                key_len
            );
            let key = &self.data[cell_offset..cell_offset + key_len];
            let ts_start = cell_offset + key_len;
            let timestamp = u64::from_le_bytes(
                self.data[ts_start..ts_start + 8].try_into().unwrap(),
            );
            let value_len =
                u16::from_le_bytes(self.data[ts_start + 8..ts_start + 10].try_into().unwrap());
            let value = if value_len == TOMBSTONE_LEN {
                None
            } else {
                let value_start = fixed_end;
                ensure!(
                    value_start + value_len as usize <= self.data.len(),
                    "value extends beyond block"
                );
                Some(&self.data[value_start..value_start + value_len as usize])
            };
            Ok((key, Recency(timestamp), value))
        }

        pub fn key_at(&self, index: usize) -> Result<&[u8]> {
            Ok(self.cell_at(index)?.0)
        }

        pub fn timestamp_at(&self, index: usize) -> Result<Recency> {
            Ok(self.cell_at(index)?.1)
        }

        /// `None` when the entry is a tombstone.
        pub fn value_at(&self, index: usize) -> Result<Option<&[u8]>> {
            Ok(self.cell_at(index)?.2)
        }

        pub fn is_tombstone_at(&self, index: usize) -> Result<bool> {
            Ok(self.cell_at(index)?.2.is_none())
        }

        /// Number of non-tombstone entries.
        pub fn live_count(&self) -> usize {
            let count = self.entry_count() as usize;
            (0..count)
                .filter(|&i| matches!(self.cell_at(i), Ok((_, _, Some(_)))))
                .count()
        }

        /// Live bytes (slots + cells) this node occupies, the input to
        /// underfull/mergeable decisions.
        pub fn used_bytes(&self) -> usize {
            let count = self.entry_count() as usize;
            let mut used = count * LEAF_SLOT_SIZE;
            for i in 0..count {
                if let Ok((key, _, value)) = self.cell_at(i) {
                    used += leaf_cell_size(key.len(), value.map(<[u8]>::len));
                }
            }
            used
        }

        /// Two-phase search: prefix scan, then full key comparison on
        /// prefix match.
        pub fn find_key(&self, key: &[u8]) -> SearchResult {
            let target_prefix = u32::from_be_bytes(extract_prefix(key));
            let count = self.entry_count() as usize;

            for i in 0..count {
                let slot = match self.slot_at(i) {
                    Ok(s) => s,
                    Err(_) => return SearchResult::NotFound(i),
                };

                let slot_prefix = slot.prefix_as_u32();

                if slot_prefix > target_prefix {
                    return SearchResult::NotFound(i);
                }

                if slot_prefix == target_prefix {
                    let full_key = match self.key_at(i) {
                        Ok(k) => k,
                        Err(_) => return SearchResult::NotFound(i),
                    };

                    match full_key.cmp(key) {
                        std::cmp::Ordering::Equal => return SearchResult::Found(i),
                        std::cmp::Ordering::Greater => return SearchResult::NotFound(i),
                        std::cmp::Ordering::Less => continue,
                    }
                }
            }

            SearchResult::NotFound(count)
        }

        /// Copies every entry (tombstones included) into the arena, in key
        /// order.
        pub fn collect_entries<'b>(&self, bump: &'b Bump) -> Result<BumpVec<'b, LeafEntry<'b>>> {
            let count = self.entry_count() as usize;
            let mut entries = BumpVec::with_capacity_in(count, bump);
            for i in 0..count {
                let (key, timestamp, value) = self.cell_at(i)?;
                entries.push(LeafEntry {
                    key: bump.alloc_slice_copy(key),
                    timestamp,
                    value: value.map(|v| &*bump.alloc_slice_copy(v)),
                });
            }
            Ok(entries)
        }
    };
}

impl<'a> LeafNode<'a> {
    pub fn from_block(data: &'a [u8]) -> Result<Self> {
        validate_leaf(data)?;
        Ok(Self { data })
    }

    leaf_read_impl!();
}

impl<'a> LeafNodeMut<'a> {
    pub fn from_block(data: &'a mut [u8]) -> Result<Self> {
        validate_leaf(data)?;
        Ok(Self { data })
    }

    /// Formats the block as an empty leaf.
    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() > BLOCK_HEADER_SIZE,
            "block of {} bytes too small for a leaf",
            data.len()
        );
        let block_len = data.len();
        let header = NodeHeader::from_bytes_mut(data)?;
        header.set_node_type(NodeType::Leaf);
        header.set_entry_count(0);
        header.set_free_start(BLOCK_HEADER_SIZE as u16);
        header.set_free_end(block_len as u16);
        header.set_node_recency(Recency::ZERO);
        header.set_right_child(0);
        Ok(Self { data })
    }

    leaf_read_impl!();

    fn header_mut(&mut self) -> &mut NodeHeader {
        NodeHeader::from_bytes_mut(self.data).unwrap()
    }

    pub fn set_recency(&mut self, recency: Recency) {
        self.header_mut().set_node_recency(recency);
    }

    /// Stranded cell bytes reclaimable by compaction.
    fn garbage_bytes(&self) -> usize {
        let usable = self.data.len() - BLOCK_HEADER_SIZE;
        usable - self.free_space() - self.used_bytes()
    }

    /// Inserts a live entry (`value` = Some) or a tombstone (`value` =
    /// None), replacing any existing entry for the key.
    pub fn insert_entry(&mut self, key: &[u8], value: Option<&[u8]>, timestamp: Recency) -> Result<()> {
        ensure!(!key.is_empty(), "empty key");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key of {} bytes exceeds maximum {}",
            key.len(),
            MAX_KEY_SIZE
        );
        if let Some(v) = value {
            ensure!(
                v.len() <= MAX_LEAF_VALUE_SIZE,
                "value of {} bytes exceeds leaf maximum {}",
                v.len(),
                MAX_LEAF_VALUE_SIZE
            );
        }

        let insert_pos = match self.find_key(key) {
            SearchResult::Found(i) => {
                self.erase_at(i)?;
                i
            }
            SearchResult::NotFound(i) => i,
        };

        let cell_size = leaf_cell_size(key.len(), value.map(<[u8]>::len));
        let space_needed = cell_size + LEAF_SLOT_SIZE;
        if self.free_space() < space_needed {
            ensure!(
                self.free_space() + self.garbage_bytes() >= space_needed,
                "not enough free space: need {}, have {} (+{} reclaimable)",
                space_needed,
                self.free_space(),
                self.garbage_bytes()
            );
            self.compact()?;
        }

        let header = NodeHeader::from_bytes(self.data)?;
        let new_free_end = header.free_end() as usize - cell_size;
        let mut offset = new_free_end;

        self.data[offset..offset + key.len()].copy_from_slice(key);
        offset += key.len();
        self.data[offset..offset + 8].copy_from_slice(&timestamp.0.to_le_bytes());
        offset += 8;
        match value {
            Some(v) => {
                self.data[offset..offset + 2].copy_from_slice(&(v.len() as u16).to_le_bytes());
                offset += 2;
                self.data[offset..offset + v.len()].copy_from_slice(v);
            }
            None => {
                self.data[offset..offset + 2].copy_from_slice(&TOMBSTONE_LEN.to_le_bytes());
            }
        }

        let entry_count = self.entry_count() as usize;
        for i in (insert_pos..entry_count).rev() {
            let src = self.slot_offset(i);
            let dst = self.slot_offset(i + 1);
            self.data.copy_within(src..src + LEAF_SLOT_SIZE, dst);
        }

        let slot = LeafSlot::new(key, new_free_end as u16);
        let slot_offset = self.slot_offset(insert_pos);
        self.data[slot_offset..slot_offset + LEAF_SLOT_SIZE].copy_from_slice(slot.as_bytes());

        let header = self.header_mut();
        header.set_entry_count(entry_count as u16 + 1);
        header.set_free_start(header.free_start() + LEAF_SLOT_SIZE as u16);
        header.set_free_end(new_free_end as u16);
        Ok(())
    }

    /// Replaces the entry for `key` with a tombstone stamped `timestamp`.
    /// Inserts a fresh tombstone if the key is absent.
    pub fn make_tombstone(&mut self, key: &[u8], timestamp: Recency) -> Result<()> {
        self.insert_entry(key, None, timestamp)
    }

    /// Removes the slot at `index` outright. No timestamp bookkeeping: this
    /// is the erase path, used for housekeeping deletes that sit outside
    /// the replication horizon.
    pub fn erase_at(&mut self, index: usize) -> Result<()> {
        let entry_count = self.entry_count() as usize;
        ensure!(
            index < entry_count,
            "erase index {} out of bounds (entry_count={})",
            index,
            entry_count
        );
        for i in index..entry_count - 1 {
            let src = self.slot_offset(i + 1);
            let dst = self.slot_offset(i);
            self.data.copy_within(src..src + LEAF_SLOT_SIZE, dst);
        }
        let header = self.header_mut();
        header.set_entry_count(entry_count as u16 - 1);
        header.set_free_start(header.free_start() - LEAF_SLOT_SIZE as u16);
        Ok(())
    }

    /// Removes the entry for `key` if present. Returns whether it existed.
    pub fn erase_key(&mut self, key: &[u8]) -> Result<bool> {
        match self.find_key(key) {
            SearchResult::Found(i) => {
                self.erase_at(i)?;
                Ok(true)
            }
            SearchResult::NotFound(_) => Ok(false),
        }
    }

    /// Rewrites all live cells contiguously from the block end.
    fn compact(&mut self) -> Result<()> {
        let entry_count = self.entry_count() as usize;
        let block_len = self.data.len();
        if entry_count == 0 {
            let header = self.header_mut();
            header.set_free_end(block_len as u16);
            return Ok(());
        }

        let mut cells: Vec<(LeafSlot, Vec<u8>)> = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let slot = *self.slot_at(i)?;
            let (key, _, value) = self.cell_at(i)?;
            let cell_start = slot.offset.get() as usize;
            let cell_end = cell_start + leaf_cell_size(key.len(), value.map(<[u8]>::len));
            cells.push((slot, self.data[cell_start..cell_end].to_vec()));
        }

        let mut new_free_end = block_len;
        for (i, (mut slot, cell)) in cells.into_iter().enumerate() {
            new_free_end -= cell.len();
            self.data[new_free_end..new_free_end + cell.len()].copy_from_slice(&cell);
            slot.offset = U16::new(new_free_end as u16);
            let slot_offset = self.slot_offset(i);
            self.data[slot_offset..slot_offset + LEAF_SLOT_SIZE].copy_from_slice(slot.as_bytes());
        }

        let header = self.header_mut();
        header.set_free_end(new_free_end as u16);
        Ok(())
    }

    /// Reformats this block and appends `entries` in order. Entries must be
    /// sorted by key; used by rebalancing after redistribution.
    pub fn write_entries(&mut self, entries: &[LeafEntry<'_>], recency: Recency) -> Result<()> {
        let block_len = self.data.len();
        {
            let header = self.header_mut();
            header.set_entry_count(0);
            header.set_free_start(BLOCK_HEADER_SIZE as u16);
            header.set_free_end(block_len as u16);
            header.set_node_recency(recency);
        }
        for window in entries.windows(2) {
            ensure!(window[0].key < window[1].key, "unsorted leaf rebuild");
        }
        for entry in entries {
            self.insert_entry(entry.key, entry.value, entry.timestamp)?;
        }
        Ok(())
    }

    /// Moves the upper half of this node's entries into `right` (a fresh
    /// block), returning the median: the surviving node's largest key.
    /// Everything left of the split is ≤ median, everything moved is >
    /// median. The caller propagates recency and parent bookkeeping.
    pub fn split_into(&mut self, right: &mut [u8]) -> Result<SeparatorKey> {
        let entry_count = self.entry_count() as usize;
        ensure!(entry_count >= 2, "split of leaf with {} entries", entry_count);

        let bump = Bump::new();
        let entries = self.collect_entries(&bump)?;
        let total: usize = entries.iter().map(LeafEntry::cost).sum();

        let mut acc = 0usize;
        let mut split = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            acc += entry.cost();
            if acc >= total / 2 {
                split = i + 1;
                break;
            }
        }
        let split = split.clamp(1, entry_count - 1);

        let recency = self.recency();
        self.write_entries(&entries[..split], recency)?;

        let mut right_node = LeafNodeMut::init(right)?;
        right_node.write_entries(&entries[split..], recency)?;

        Ok(SeparatorKey::from_slice(entries[split - 1].key))
    }
}
