//! # Coroutine Runtime
//!
//! User-space cooperative multitasking. A [`Runtime`] owns N worker
//! threads; each worker schedules coroutines from its own queue, and a
//! coroutine stays on its home worker until it explicitly migrates
//! ([`move_to_thread`], [`OnThread`]). Since workers never preempt and
//! never run two coroutines at once, code between suspension points needs
//! no locking against its own worker.
//!
//! The layers, bottom up:
//!
//! - [`stack`]: mmapped stacks with a guard page against overflow
//! - `context`: the saved-register capsule and the naked-asm switch
//!   (or the threaded fallback, one parked OS thread per context)
//! - `action`: the run-once closure a coroutine executes, stored inline
//! - `coroutine`: the coroutine object, wait/notify, spawn, migration
//! - `runtime`: worker threads, run queues, quiescence tracking

cfg_if::cfg_if! {
    if #[cfg(any(
        feature = "threaded-coroutines",
        not(any(target_arch = "x86_64", target_arch = "aarch64"))
    ))] {
        mod threaded;
        pub(crate) use threaded as context;
    } else {
        mod context;
    }
}

mod action;
mod coroutine;
mod runtime;
pub mod stack;

pub use coroutine::{
    call_with_enough_stack, current, move_to_thread, spawn_later_ordered, spawn_now,
    spawn_sometime, wait, yield_now, yield_ordered, CoroHandle, OnThread,
};
pub use runtime::Runtime;
pub use stack::Stack;
