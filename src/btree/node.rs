//! # Node Header Layout
//!
//! Every tree block begins with a 24-byte header shared by leaf and
//! internal nodes.
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       1     node_type    Leaf (0x02) or Internal (0x01)
//! 1       1     flags        Reserved
//! 2       2     entry_count  Number of slots in this node
//! 4       2     free_start   Offset where free space begins
//! 6       2     free_end     Offset where free space ends
//! 8       8     recency      Upper bound on subtree modification time
//! 16      8     right_child  Internal: rightmost child. Leaf: unused (0).
//! ```
//!
//! The header is read in place from block buffers via zerocopy; all
//! multi-byte fields are explicit little-endian. Offsets are u16, which
//! caps the block size at 32 KiB (`config::MAX_BLOCK_SIZE`).
//!
//! The recency field here mirrors the recency the block cache persists per
//! block; nodes keep their own copy so a node image is self-describing when
//! shipped during backfill.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::Recency;
use crate::config::BLOCK_HEADER_SIZE;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Unknown = 0x00,
    Internal = 0x01,
    Leaf = 0x02,
}

impl NodeType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => NodeType::Internal,
            0x02 => NodeType::Leaf,
            _ => NodeType::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    node_type: u8,
    flags: u8,
    entry_count: U16,
    free_start: U16,
    free_end: U16,
    recency: U64,
    right_child: U64,
}

impl NodeHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= BLOCK_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            BLOCK_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..BLOCK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read NodeHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= BLOCK_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            BLOCK_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..BLOCK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read NodeHeader: {:?}", e))
    }

    pub fn node_type(&self) -> NodeType {
        NodeType::from_byte(self.node_type)
    }

    pub fn set_node_type(&mut self, node_type: NodeType) {
        self.node_type = node_type as u8;
    }

    pub fn node_recency(&self) -> Recency {
        Recency(self.recency())
    }

    pub fn set_node_recency(&mut self, recency: Recency) {
        self.set_recency(recency.0);
    }

    zerocopy_accessors! {
        entry_count: u16,
        free_start: u16,
        free_end: u16,
        recency: u64,
        right_child: u64,
    }
}
