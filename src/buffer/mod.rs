//! # Block Cache Layer
//!
//! The tree never touches blocks directly; it goes through lock handles
//! handed out by this module. A [`BufLock`] is acquisition + access in one
//! object: holding one means holding the block's read or write lock, and
//! dropping it releases the lock. This is what makes the traversal's
//! two-node lock span enforceable by construction.
//!
//! The cache here is a purely in-memory block store. The durable buffer
//! cache (disk pages, write barriers, patch logs) lives in the storage
//! crate and exposes this same contract; the core is written against the
//! contract, not the backing.
//!
//! ## Structural Reference Counts
//!
//! Every child block referenced from a node is tracked in a refcount
//! ledger. Splits and merges relocate children between nodes; they must
//! detach each moved child from its old parent and attach it to the new
//! one, so the ledger stays balanced. A block may only be deleted once its
//! own refcount has dropped to zero.

mod cache;
mod superblock;

pub use cache::{AccessMode, BlockId, BufCache, BufLock, NULL_BLOCK_ID};
pub use superblock::{adjust_population, population, Superblock, SUPERBLOCK_ID};
