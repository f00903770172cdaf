//! # In-Memory Block Cache
//!
//! Blocks are fixed-size byte buffers identified by a monotonically
//! assigned [`BlockId`]. Each block is guarded by its own `RwLock`; the
//! guard is owned by the [`BufLock`] handle (parking_lot's `arc_lock`
//! guards), so lock lifetime equals handle lifetime with no borrow
//! gymnastics at the call sites.
//!
//! ## Lock Discipline
//!
//! Acquisition blocks the calling OS thread until the lock is granted.
//! The tree's descent discipline (two write locks max, parent released as
//! soon as the child is held, superblock released right after the root
//! level) keeps lock spans short; concurrent traversals that touch the
//! same node serialize here.
//!
//! ## Recency
//!
//! The cache persists a recency timestamp per block alongside the data,
//! mirroring what the durable cache stores in the block's header on disk.
//! `set_recency` requires a write lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};

use crate::btree::Recency;
use crate::config::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

pub type BlockId = u64;

/// Sentinel for "no block". Never assigned to a real block.
pub const NULL_BLOCK_ID: BlockId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

struct BlockState {
    data: Box<[u8]>,
    recency: Recency,
    deleted: bool,
}

struct CacheInner {
    block_size: usize,
    blocks: RwLock<HashMap<BlockId, Arc<RwLock<BlockState>>>>,
    refcounts: Mutex<HashMap<BlockId, u32>>,
    next_id: AtomicU64,
}

/// Shared handle to the block store. Cheap to clone.
#[derive(Clone)]
pub struct BufCache {
    inner: Arc<CacheInner>,
}

impl BufCache {
    pub fn new(block_size: usize) -> Result<Self> {
        ensure!(
            (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size),
            "block size {} outside supported range [{}, {}]",
            block_size,
            MIN_BLOCK_SIZE,
            MAX_BLOCK_SIZE
        );
        Ok(Self {
            inner: Arc::new(CacheInner {
                block_size,
                blocks: RwLock::new(HashMap::new()),
                refcounts: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Allocates a zeroed block and returns it write-locked.
    pub fn create(&self) -> Result<BufLock> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(RwLock::new(BlockState {
            data: vec![0u8; self.inner.block_size].into_boxed_slice(),
            recency: Recency::ZERO,
            deleted: false,
        }));
        let guard = state.write_arc();
        self.inner.blocks.write().insert(id, state);
        Ok(BufLock {
            id,
            guard: Guard::Write(guard),
            cache: Arc::clone(&self.inner),
        })
    }

    /// Acquires an existing block. Blocks until the lock is granted.
    pub fn acquire(&self, id: BlockId, mode: AccessMode) -> Result<BufLock> {
        ensure!(id != NULL_BLOCK_ID, "acquire of null block id");
        let state = {
            let blocks = self.inner.blocks.read();
            match blocks.get(&id) {
                Some(s) => Arc::clone(s),
                None => bail!("acquire of unknown block {}", id),
            }
        };
        let guard = match mode {
            AccessMode::Read => Guard::Read(state.read_arc()),
            AccessMode::Write => Guard::Write(state.write_arc()),
        };
        let lock = BufLock {
            id,
            guard,
            cache: Arc::clone(&self.inner),
        };
        ensure!(!lock.state().deleted, "acquire of deleted block {}", id);
        Ok(lock)
    }

    /// Structural refcount of a block. Used by tests and assertions.
    pub fn refcount(&self, id: BlockId) -> u32 {
        self.inner.refcounts.lock().get(&id).copied().unwrap_or(0)
    }

    /// Number of live blocks. Deleted blocks leave the map immediately.
    pub fn live_blocks(&self) -> usize {
        self.inner.blocks.read().len()
    }
}

enum Guard {
    Read(ArcRwLockReadGuard<RawRwLock, BlockState>),
    Write(ArcRwLockWriteGuard<RawRwLock, BlockState>),
}

/// Lock handle for one block. Holding it holds the block's lock.
pub struct BufLock {
    id: BlockId,
    guard: Guard,
    cache: Arc<CacheInner>,
}

impl BufLock {
    pub fn block_id(&self) -> BlockId {
        self.id
    }

    pub fn mode(&self) -> AccessMode {
        match self.guard {
            Guard::Read(_) => AccessMode::Read,
            Guard::Write(_) => AccessMode::Write,
        }
    }

    fn state(&self) -> &BlockState {
        match &self.guard {
            Guard::Read(g) => g,
            Guard::Write(g) => g,
        }
    }

    fn state_mut(&mut self) -> &mut BlockState {
        match &mut self.guard {
            Guard::Read(_) => panic!("write access through a read lock on block {}", self.id),
            Guard::Write(g) => g,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.state().data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.state_mut().data
    }

    pub fn recency(&self) -> Recency {
        self.state().recency
    }

    pub fn set_recency(&mut self, recency: Recency) {
        self.state_mut().recency = recency;
    }

    /// Records a structural reference from this block to `child`.
    pub fn attach_child(&mut self, child: BlockId) {
        debug_assert_eq!(self.mode(), AccessMode::Write);
        let mut refcounts = self.cache.refcounts.lock();
        *refcounts.entry(child).or_insert(0) += 1;
    }

    /// Drops a structural reference from this block to `child`.
    ///
    /// The parent identity matters for the caller's bookkeeping (relocated
    /// children are detached from their *old* parent), but the ledger itself
    /// only tracks the count.
    pub fn detach_child(&mut self, child: BlockId) {
        debug_assert_eq!(self.mode(), AccessMode::Write);
        let mut refcounts = self.cache.refcounts.lock();
        match refcounts.get_mut(&child) {
            Some(n) if *n > 0 => *n -= 1,
            _ => panic!(
                "detach_child underflow: block {} detached from {} with no reference",
                child, self.id
            ),
        }
    }

    /// Deletes the block. The block must be unreferenced; acquiring it
    /// afterwards is an error.
    pub fn mark_deleted(mut self) -> Result<()> {
        let remaining = self
            .cache
            .refcounts
            .lock()
            .get(&self.id)
            .copied()
            .unwrap_or(0);
        ensure!(
            remaining == 0,
            "delete of block {} with {} structural references",
            self.id,
            remaining
        );
        // the `deleted` flag catches an acquire that cloned the state
        // before the map entry disappeared and is blocked on our lock
        self.state_mut().deleted = true;
        self.cache.refcounts.lock().remove(&self.id);
        self.cache.blocks.write().remove(&self.id);
        Ok(())
    }
}
