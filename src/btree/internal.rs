//! # Internal Node Layout
//!
//! Internal nodes route descent: each slot pairs a separator key with the
//! child covering keys up to and including that separator. One extra child,
//! the header's `right_child`, covers everything greater than the last
//! separator.
//!
//! ## Slot Array
//!
//! ```text
//! InternalSlot (16 bytes):
//! +-----------------+--------+--------+--------------------------------+
//! | prefix (4B)     | off 2B | len 2B | child block id (8B LE)         |
//! +-----------------+--------+--------+--------------------------------+
//! ```
//!
//! The child id lives in the slot itself, so a routing decision that wins
//! on the 4-byte prefix never touches cell content. Cells hold only the
//! separator key bytes and grow upward from the block end, like leaf cells.
//!
//! ## Routing
//!
//! For separator S at slot i: keys ≤ S descend into slot i's child; keys
//! greater than every separator descend into `right_child`. An exact match
//! on a separator goes *left* — split medians are the left half's largest
//! key, so the matching entry lives there.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::leaf::extract_prefix;
use crate::btree::node::{NodeHeader, NodeType};
use crate::btree::{Recency, SeparatorKey};
use crate::config::{BLOCK_HEADER_SIZE, MAX_KEY_SIZE};

pub const INTERNAL_SLOT_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct InternalSlot {
    pub prefix: [u8; 4],
    pub offset: U16,
    pub key_len: U16,
    pub child: U64,
}

impl InternalSlot {
    pub fn new(key: &[u8], offset: u16, child: u64) -> Self {
        Self {
            prefix: extract_prefix(key),
            offset: U16::new(offset),
            key_len: U16::new(key.len() as u16),
            child: U64::new(child),
        }
    }

    pub fn prefix_as_u32(&self) -> u32 {
        u32::from_be_bytes(self.prefix)
    }
}

/// One decoded routing entry, arena-backed during rebalancing.
#[derive(Debug, Clone, Copy)]
pub struct InternalEntry<'a> {
    pub key: &'a [u8],
    pub child: u64,
}

impl InternalEntry<'_> {
    pub fn cost(&self) -> usize {
        INTERNAL_SLOT_SIZE + self.key.len()
    }
}

#[derive(Debug)]
pub struct InternalNode<'a> {
    data: &'a [u8],
}

pub struct InternalNodeMut<'a> {
    data: &'a mut [u8],
}

fn validate_internal(data: &[u8]) -> Result<()> {
    let header = NodeHeader::from_bytes(data)?;
    ensure!(
        header.node_type() == NodeType::Internal,
        "expected Internal block, got {:?}",
        header.node_type()
    );
    ensure!(
        header.free_end() as usize <= data.len(),
        "internal free_end {} beyond block of {} bytes",
        header.free_end(),
        data.len()
    );
    Ok(())
}

macro_rules! internal_read_impl {
    () => {
        pub fn entry_count(&self) -> u16 {
            let header = NodeHeader::from_bytes(self.data).unwrap();
            header.entry_count()
        }

        pub fn recency(&self) -> Recency {
            let header = NodeHeader::from_bytes(self.data).unwrap();
            header.node_recency()
        }

        pub fn right_child(&self) -> u64 {
            let header = NodeHeader::from_bytes(self.data).unwrap();
            header.right_child()
        }

        pub fn free_space(&self) -> usize {
            let header = NodeHeader::from_bytes(self.data).unwrap();
            (header.free_end() - header.free_start()) as usize
        }

        fn slot_offset(&self, index: usize) -> usize {
            BLOCK_HEADER_SIZE + index * INTERNAL_SLOT_SIZE
        }

        pub fn slot_at(&self, index: usize) -> Result<&InternalSlot> {
            ensure!(
                index < self.entry_count() as usize,
                "slot index {} out of bounds (entry_count={})",
                index,
                self.entry_count()
            );
            let offset = self.slot_offset(index);
            InternalSlot::ref_from_bytes(&self.data[offset..offset + INTERNAL_SLOT_SIZE])
                .map_err(|e| eyre::eyre!("failed to read internal slot at index {}: {:?}", index, e))
        }

        pub fn key_at(&self, index: usize) -> Result<&[u8]> {
            let slot = self.slot_at(index)?;
            let start = slot.offset.get() as usize;
            let end = start + slot.key_len.get() as usize;
            ensure!(end <= self.data.len(), "separator extends beyond block");
            Ok(&self.data[start..end])
        }

        pub fn child_at(&self, index: usize) -> Result<u64> {
            Ok(self.slot_at(index)?.child.get())
        }

        /// Child block to descend into for `key`. Keys ≤ a separator go to
        /// that separator's child; keys past every separator go right.
        pub fn find_child(&self, key: &[u8]) -> Result<u64> {
            match self.find_routing_slot(key)? {
                Some(i) => self.child_at(i),
                None => Ok(self.right_child()),
            }
        }

        /// Slot whose child covers `key`, or `None` for `right_child`.
        pub fn find_routing_slot(&self, key: &[u8]) -> Result<Option<usize>> {
            let target_prefix = u32::from_be_bytes(extract_prefix(key));
            let count = self.entry_count() as usize;

            for i in 0..count {
                let slot = self.slot_at(i)?;
                let slot_prefix = slot.prefix_as_u32();

                if slot_prefix > target_prefix {
                    return Ok(Some(i));
                }
                if slot_prefix == target_prefix && self.key_at(i)? >= key {
                    return Ok(Some(i));
                }
            }
            Ok(None)
        }

        /// Slot currently routing to `child`, or `None` if `child` is the
        /// right child. Fails if `child` is not referenced at all.
        pub fn slot_of_child(&self, child: u64) -> Result<Option<usize>> {
            for i in 0..self.entry_count() as usize {
                if self.child_at(i)? == child {
                    return Ok(Some(i));
                }
            }
            ensure!(
                self.right_child() == child,
                "block {} is not a child of this node",
                child
            );
            Ok(None)
        }

        /// Every child id, slots first, right child last.
        pub fn children(&self) -> Result<Vec<u64>> {
            let count = self.entry_count() as usize;
            let mut out = Vec::with_capacity(count + 1);
            for i in 0..count {
                out.push(self.child_at(i)?);
            }
            out.push(self.right_child());
            Ok(out)
        }

        pub fn used_bytes(&self) -> usize {
            let count = self.entry_count() as usize;
            let mut used = count * INTERNAL_SLOT_SIZE;
            for i in 0..count {
                if let Ok(slot) = self.slot_at(i) {
                    used += slot.key_len.get() as usize;
                }
            }
            used
        }

        /// Copies every separator entry into the arena, in key order. The
        /// right child is not included; callers read it separately.
        pub fn collect_entries<'b>(
            &self,
            bump: &'b Bump,
        ) -> Result<BumpVec<'b, InternalEntry<'b>>> {
            let count = self.entry_count() as usize;
            let mut entries = BumpVec::with_capacity_in(count, bump);
            for i in 0..count {
                entries.push(InternalEntry {
                    key: bump.alloc_slice_copy(self.key_at(i)?),
                    child: self.child_at(i)?,
                });
            }
            Ok(entries)
        }
    };
}

impl<'a> InternalNode<'a> {
    pub fn from_block(data: &'a [u8]) -> Result<Self> {
        validate_internal(data)?;
        Ok(Self { data })
    }

    internal_read_impl!();
}

impl<'a> InternalNodeMut<'a> {
    pub fn from_block(data: &'a mut [u8]) -> Result<Self> {
        validate_internal(data)?;
        Ok(Self { data })
    }

    /// Formats the block as an empty internal node routing everything to
    /// `right_child`.
    pub fn init(data: &'a mut [u8], right_child: u64) -> Result<Self> {
        ensure!(
            data.len() > BLOCK_HEADER_SIZE,
            "block of {} bytes too small for an internal node",
            data.len()
        );
        let block_len = data.len();
        let header = NodeHeader::from_bytes_mut(data)?;
        header.set_node_type(NodeType::Internal);
        header.set_entry_count(0);
        header.set_free_start(BLOCK_HEADER_SIZE as u16);
        header.set_free_end(block_len as u16);
        header.set_node_recency(Recency::ZERO);
        header.set_right_child(right_child);
        Ok(Self { data })
    }

    internal_read_impl!();

    fn header_mut(&mut self) -> &mut NodeHeader {
        NodeHeader::from_bytes_mut(self.data).unwrap()
    }

    pub fn set_recency(&mut self, recency: Recency) {
        self.header_mut().set_node_recency(recency);
    }

    pub fn set_right_child(&mut self, child: u64) {
        self.header_mut().set_right_child(child);
    }

    pub fn set_child_at(&mut self, index: usize, child: u64) -> Result<()> {
        ensure!(
            index < self.entry_count() as usize,
            "slot index {} out of bounds (entry_count={})",
            index,
            self.entry_count()
        );
        let offset = self.slot_offset(index);
        let slot =
            InternalSlot::mut_from_bytes(&mut self.data[offset..offset + INTERNAL_SLOT_SIZE])
                .map_err(|e| eyre::eyre!("failed to read internal slot: {:?}", e))?;
        slot.child = U64::new(child);
        Ok(())
    }

    fn garbage_bytes(&self) -> usize {
        let usable = self.data.len() - BLOCK_HEADER_SIZE;
        usable - self.free_space() - self.used_bytes()
    }

    /// Inserts a separator routing keys ≤ `key` to `child`. The key must
    /// not already be present.
    pub fn insert_separator(&mut self, key: &[u8], child: u64) -> Result<()> {
        ensure!(!key.is_empty(), "empty separator");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "separator of {} bytes exceeds maximum {}",
            key.len(),
            MAX_KEY_SIZE
        );

        let insert_pos = match self.find_routing_slot(key)? {
            Some(i) => {
                ensure!(self.key_at(i)? != key, "duplicate separator");
                i
            }
            None => self.entry_count() as usize,
        };

        let space_needed = key.len() + INTERNAL_SLOT_SIZE;
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
        let new_free_end = header.free_end() as usize - key.len();
        self.data[new_free_end..new_free_end + key.len()].copy_from_slice(key);

        let entry_count = self.entry_count() as usize;
        for i in (insert_pos..entry_count).rev() {
            let src = self.slot_offset(i);
            let dst = self.slot_offset(i + 1);
            self.data.copy_within(src..src + INTERNAL_SLOT_SIZE, dst);
        }

        let slot = InternalSlot::new(key, new_free_end as u16, child);
        let slot_offset = self.slot_offset(insert_pos);
        self.data[slot_offset..slot_offset + INTERNAL_SLOT_SIZE].copy_from_slice(slot.as_bytes());

        let header = self.header_mut();
        header.set_entry_count(entry_count as u16 + 1);
        header.set_free_start(header.free_start() + INTERNAL_SLOT_SIZE as u16);
        header.set_free_end(new_free_end as u16);
        Ok(())
    }

    /// Records a child split: the child that used to cover `median`'s whole
    /// range kept the low half (`left`), a fresh block took the high half
    /// (`right`). Whatever routed to the old child now routes to `right`,
    /// and a new separator sends keys ≤ `median` to `left`.
    pub fn record_split(&mut self, median: &[u8], left: u64, right: u64) -> Result<()> {
        match self.slot_of_child(left)? {
            Some(i) => self.set_child_at(i, right)?,
            None => self.set_right_child(right),
        }
        self.insert_separator(median, left)
    }

    /// Removes the separator at `index`; its child is no longer referenced
    /// from this node.
    pub fn remove_separator_at(&mut self, index: usize) -> Result<()> {
        let entry_count = self.entry_count() as usize;
        ensure!(
            index < entry_count,
            "remove index {} out of bounds (entry_count={})",
            index,
            entry_count
        );
        for i in index..entry_count - 1 {
            let src = self.slot_offset(i + 1);
            let dst = self.slot_offset(i);
            self.data.copy_within(src..src + INTERNAL_SLOT_SIZE, dst);
        }
        let header = self.header_mut();
        header.set_entry_count(entry_count as u16 - 1);
        header.set_free_start(header.free_start() - INTERNAL_SLOT_SIZE as u16);
        Ok(())
    }

    /// Swaps the separator at `index` for `new_key`, keeping its child.
    /// Used after leveling, when the boundary between two siblings moves.
    pub fn replace_separator_at(&mut self, index: usize, new_key: &[u8]) -> Result<()> {
        let child = self.child_at(index)?;
        self.remove_separator_at(index)?;
        self.insert_separator(new_key, child)
    }

    fn compact(&mut self) -> Result<()> {
        let entry_count = self.entry_count() as usize;
        let block_len = self.data.len();

        let mut cells: Vec<(InternalSlot, Vec<u8>)> = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let slot = *self.slot_at(i)?;
            cells.push((slot, self.key_at(i)?.to_vec()));
        }

        let mut new_free_end = block_len;
        for (i, (mut slot, key)) in cells.into_iter().enumerate() {
            new_free_end -= key.len();
            self.data[new_free_end..new_free_end + key.len()].copy_from_slice(&key);
            slot.offset = U16::new(new_free_end as u16);
            let slot_offset = self.slot_offset(i);
            self.data[slot_offset..slot_offset + INTERNAL_SLOT_SIZE]
                .copy_from_slice(slot.as_bytes());
        }

        let header = self.header_mut();
        header.set_free_end(new_free_end as u16);
        Ok(())
    }

    /// Reformats this block and appends `entries` in order, with
    /// `right_child` covering the tail range.
    pub fn write_entries(
        &mut self,
        entries: &[InternalEntry<'_>],
        right_child: u64,
        recency: Recency,
    ) -> Result<()> {
        let block_len = self.data.len();
        {
            let header = self.header_mut();
            header.set_entry_count(0);
            header.set_free_start(BLOCK_HEADER_SIZE as u16);
            header.set_free_end(block_len as u16);
            header.set_node_recency(recency);
            header.set_right_child(right_child);
        }
        for window in entries.windows(2) {
            ensure!(window[0].key < window[1].key, "unsorted internal rebuild");
        }
        for entry in entries {
            self.insert_separator(entry.key, entry.child)?;
        }
        Ok(())
    }

    /// Splits this node, *promoting* the median separator: the low half
    /// keeps this block with the median's child as its new right child, the
    /// high half moves into `right`. Returns the promoted median, which the
    /// caller must re-insert into the parent (it appears in neither half).
    pub fn split_into(&mut self, right: &mut [u8]) -> Result<SeparatorKey> {
        let entry_count = self.entry_count() as usize;
        ensure!(
            entry_count >= 3,
            "split of internal node with {} separators",
            entry_count
        );

        let bump = Bump::new();
        let entries = self.collect_entries(&bump)?;
        let total: usize = entries.iter().map(InternalEntry::cost).sum();

        let mut acc = 0usize;
        let mut median = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            acc += entry.cost();
            if acc >= total / 2 {
                median = i;
                break;
            }
        }
        let median = median.clamp(1, entry_count - 2);

        let recency = self.recency();
        let old_right_child = self.right_child();
        let median_key = SeparatorKey::from_slice(entries[median].key);
        let median_child = entries[median].child;

        self.write_entries(&entries[..median], median_child, recency)?;

        let mut right_node = InternalNodeMut::init(right, old_right_child)?;
        right_node.write_entries(&entries[median + 1..], old_right_child, recency)?;

        Ok(median_key)
    }
}
