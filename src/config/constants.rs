//! # BurrowDB Configuration Constants
//!
//! All numeric configuration for the storage core lives here. Constants that
//! depend on each other are co-located and the relationships documented.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_BLOCK_SIZE (4096 bytes)
//!       │
//!       ├─> MIN_BLOCK_SIZE / MAX_BLOCK_SIZE bound it
//!       │     Node headers store free_start/free_end as u16, so a block
//!       │     can never exceed 32768 bytes without widening the header.
//!       │
//!       ├─> BLOCK_HEADER_SIZE (24 bytes, fixed)
//!       │
//!       └─> MAX_KEY_SIZE (250 bytes)
//!             An internal node must always be able to hold at least four
//!             worst-case separators, which bounds MAX_KEY_SIZE well below
//!             MIN_BLOCK_SIZE / 4.
//!
//! DEFAULT_STACK_SIZE (128 KiB)
//!       │
//!       ├─> Must be a multiple of the OS page size (one page is sacrificed
//!       │     to the overflow guard).
//!       │
//!       └─> MIN_STACK_HEADROOM (16 KiB)
//!             call_with_enough_stack() escapes to a fresh coroutine below
//!             this threshold; it must be far smaller than the stack itself.
//!
//! CORO_FREE_LIST_MAX (64)
//!       Idle coroutines kept per worker thread. Each holds a full stack,
//!       so this bounds idle address-space usage per thread.
//! ```

/// Default block size for tree nodes, in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Smallest supported block size. Small blocks are used by tests to force
/// frequent splits and merges.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Largest supported block size. Node headers address offsets with u16.
pub const MAX_BLOCK_SIZE: usize = 32768;

/// Size of the common node header at the start of every tree block.
pub const BLOCK_HEADER_SIZE: usize = 24;

/// Maximum key length accepted by the tree.
pub const MAX_KEY_SIZE: usize = 250;

/// Default coroutine stack size, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Remaining-stack threshold below which `call_with_enough_stack` escapes
/// to a nested coroutine.
pub const MIN_STACK_HEADROOM: usize = 16 * 1024;

/// Maximum number of finished coroutines pooled per worker thread.
pub const CORO_FREE_LIST_MAX: usize = 64;

const _: () = assert!(MIN_BLOCK_SIZE <= DEFAULT_BLOCK_SIZE);
const _: () = assert!(DEFAULT_BLOCK_SIZE <= MAX_BLOCK_SIZE);
const _: () = assert!(MAX_BLOCK_SIZE <= u16::MAX as usize + 1);
const _: () = assert!(MAX_KEY_SIZE < MIN_BLOCK_SIZE / 2);
const _: () = assert!(MIN_STACK_HEADROOM < DEFAULT_STACK_SIZE / 2);
const _: () = assert!(DEFAULT_STACK_SIZE % 4096 == 0);
