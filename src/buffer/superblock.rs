//! # Superblock and Stat Block
//!
//! The superblock is the fixed entry point into a tree: it names the root
//! block and the out-of-band stat block. It is always block 1.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  -------------------------------------
//! 0       8     magic       b"burrowsb"
//! 8       8     root        Root block id (0 = empty tree)
//! 16      8     stat_block  Population counter block id
//! ```
//!
//! ## Stat Block
//!
//! The population counter deliberately lives outside the tree: it is locked
//! through the cache with no node as its parent, so mutations can adjust it
//! without holding any tree lock and without subjecting it to the tree's
//! consistency view. The count is a convergent ±1/0 adjustment per
//! mutation, not a transactional value.

use eyre::{ensure, Result};
use zerocopy::little_endian::{I64, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::cache::{AccessMode, BlockId, BufCache, BufLock, NULL_BLOCK_ID};

pub const SUPERBLOCK_ID: BlockId = 1;

const SUPERBLOCK_MAGIC: [u8; 8] = *b"burrowsb";
const STAT_BLOCK_MAGIC: [u8; 8] = *b"burrowst";

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SuperblockData {
    magic: [u8; 8],
    root: U64,
    stat_block: U64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct StatBlockData {
    magic: [u8; 8],
    population: I64,
}

/// Write-locked superblock handle.
///
/// Traversal releases this as early as structurally possible (right after
/// passing the root level), either back to the caller or into the
/// key-value location, to keep superblock contention windows short.
pub struct Superblock {
    lock: BufLock,
}

impl Superblock {
    /// Initializes a brand-new superblock + stat block pair. Must be the
    /// first allocation in the cache.
    pub fn create(cache: &BufCache) -> Result<Superblock> {
        let mut lock = cache.create()?;
        ensure!(
            lock.block_id() == SUPERBLOCK_ID,
            "superblock must be block {}, got {}",
            SUPERBLOCK_ID,
            lock.block_id()
        );

        let mut stat = cache.create()?;
        let stat_id = stat.block_id();
        let stat_data = StatBlockData {
            magic: STAT_BLOCK_MAGIC,
            population: I64::new(0),
        };
        stat.data_mut()[..size_of::<StatBlockData>()].copy_from_slice(stat_data.as_bytes());
        drop(stat);

        let data = SuperblockData {
            magic: SUPERBLOCK_MAGIC,
            root: U64::new(NULL_BLOCK_ID),
            stat_block: U64::new(stat_id),
        };
        lock.data_mut()[..size_of::<SuperblockData>()].copy_from_slice(data.as_bytes());
        Ok(Superblock { lock })
    }

    /// Acquires the superblock for a mutating operation.
    pub fn acquire(cache: &BufCache) -> Result<Superblock> {
        Self::acquire_with_mode(cache, AccessMode::Write)
    }

    /// Acquires the superblock shared, for read-only descents. Calling
    /// `set_root` on the result panics.
    pub fn acquire_read(cache: &BufCache) -> Result<Superblock> {
        Self::acquire_with_mode(cache, AccessMode::Read)
    }

    fn acquire_with_mode(cache: &BufCache, mode: AccessMode) -> Result<Superblock> {
        let lock = cache.acquire(SUPERBLOCK_ID, mode)?;
        let data = SuperblockData::ref_from_bytes(&lock.data()[..size_of::<SuperblockData>()])
            .map_err(|e| eyre::eyre!("failed to read superblock: {:?}", e))?;
        ensure!(data.magic == SUPERBLOCK_MAGIC, "superblock magic mismatch");
        Ok(Superblock { lock })
    }

    fn data(&self) -> &SuperblockData {
        SuperblockData::ref_from_bytes(&self.lock.data()[..size_of::<SuperblockData>()])
            .expect("superblock layout")
    }

    fn data_mut(&mut self) -> &mut SuperblockData {
        SuperblockData::mut_from_bytes(&mut self.lock.data_mut()[..size_of::<SuperblockData>()])
            .expect("superblock layout")
    }

    pub fn root(&self) -> BlockId {
        self.data().root.get()
    }

    /// Points the superblock at a new root, moving the structural reference
    /// from the old root (if any) to the new one.
    pub fn set_root(&mut self, root: BlockId) {
        let old = self.root();
        self.data_mut().root = U64::new(root);
        if root != NULL_BLOCK_ID {
            self.lock.attach_child(root);
        }
        if old != NULL_BLOCK_ID {
            self.lock.detach_child(old);
        }
    }

    pub fn stat_block(&self) -> BlockId {
        self.data().stat_block.get()
    }

    /// Points the superblock at a different stat block. The stat block is
    /// not part of the tree, so no structural reference moves with it.
    pub fn set_stat_block(&mut self, stat_block: BlockId) {
        self.data_mut().stat_block = U64::new(stat_block);
    }

    pub fn block_id(&self) -> BlockId {
        self.lock.block_id()
    }
}

/// Adjusts the population counter by `delta`, returning the new value.
///
/// The stat block is locked with the cache itself as the parent, not any
/// tree node; callers may hold or not hold tree locks while calling this.
pub fn adjust_population(cache: &BufCache, stat_block: BlockId, delta: i64) -> Result<i64> {
    if delta == 0 {
        return population(cache, stat_block);
    }
    let mut lock = cache.acquire(stat_block, AccessMode::Write)?;
    let data = StatBlockData::mut_from_bytes(&mut lock.data_mut()[..size_of::<StatBlockData>()])
        .map_err(|e| eyre::eyre!("failed to read stat block: {:?}", e))?;
    ensure!(data.magic == STAT_BLOCK_MAGIC, "stat block magic mismatch");
    let updated = data.population.get() + delta;
    data.population = I64::new(updated);
    Ok(updated)
}

/// Reads the current population counter.
pub fn population(cache: &BufCache, stat_block: BlockId) -> Result<i64> {
    let lock = cache.acquire(stat_block, AccessMode::Read)?;
    let data = StatBlockData::ref_from_bytes(&lock.data()[..size_of::<StatBlockData>()])
        .map_err(|e| eyre::eyre!("failed to read stat block: {:?}", e))?;
    ensure!(data.magic == STAT_BLOCK_MAGIC, "stat block magic mismatch");
    Ok(data.population.get())
}
