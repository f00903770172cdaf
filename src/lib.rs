//! # BurrowDB - Document Database Storage Core
//!
//! BurrowDB's core is the pair of subsystems every other layer of the
//! database stands on:
//!
//! - **Coroutine runtime**: user-space cooperative multitasking with
//!   hand-written stack switching. One scheduler per OS thread, explicit
//!   cross-thread migration, guard-page protected stacks recycled through a
//!   per-thread pool.
//! - **B-tree storage engine**: a slotted, block-oriented B-tree with a
//!   `recency` timestamp on every node. The timestamp invariant (a node's
//!   recency dominates everything beneath it) is what lets replication and
//!   backfill skip provably-unchanged subtrees.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Tree traversal / apply mutation    │
//! ├──────────────────┬──────────────────┤
//! │ Split/Merge/Level│ KeyValueLocation │
//! ├──────────────────┴──────────────────┤
//! │  Leaf / Internal node layouts       │
//! ├─────────────────────────────────────┤
//! │  Block cache (buf locks, recency)   │
//! ├─────────────────────────────────────┤
//! │  Coroutine runtime (stack, switch)  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Exactly one coroutine runs at a time per OS thread. There is no
//! preemption: a coroutine runs until it calls [`coro::wait`], yields, or
//! returns. Structural tree mutation holds write locks on at most two nodes
//! at a time (current + immediate parent), fixing fullness violations on the
//! way down so rebalancing never has to re-traverse.
//!
//! ## Module Overview
//!
//! - [`coro`]: stacks, context switching, scheduler, coroutine pool
//! - [`btree`]: node layouts, balancing, traversal, mutation
//! - [`buffer`]: block cache, superblock, population stat block
//! - [`config`]: centralized constants
//!
//! Cluster membership, the query language, changefeeds, and serialization
//! live in other crates and consume this one through the interfaces exposed
//! here.

#[macro_use]
mod macros;

pub mod btree;
pub mod buffer;
pub mod config;
pub mod coro;

pub use btree::{DeleteMode, KeyValueLocation, Recency};
pub use buffer::{AccessMode, BufCache, BufLock, Superblock};
pub use coro::{CoroHandle, OnThread, Runtime};
