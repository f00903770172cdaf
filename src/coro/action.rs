//! # Coroutine Actions
//!
//! A [`CoroAction`] holds the closure a coroutine will run next. Pooled
//! coroutines are re-armed with a new closure on every reuse, and spawn
//! sits on hot paths, so small closures are stored inline in a fixed
//! buffer instead of going through the allocator; only closures that are
//! too big (or too aligned) fall back to a box.

use std::mem::{self, MaybeUninit};
use std::ptr;

/// Inline storage size. Fits the typical capture set (a few Arcs and
/// integers) with room to spare.
const INLINE_SIZE: usize = 128;

#[repr(align(16))]
struct InlineBuf([MaybeUninit<u8>; INLINE_SIZE]);

struct InlineVtable {
    invoke: unsafe fn(*mut u8),
    drop_in_place: unsafe fn(*mut u8),
}

unsafe fn invoke_inline<F: FnOnce()>(p: *mut u8) {
    // SAFETY: caller guarantees p holds a valid F that is read exactly once
    unsafe { ptr::read(p.cast::<F>())() }
}

unsafe fn drop_inline<F>(p: *mut u8) {
    // SAFETY: caller guarantees p holds a valid F that is dropped exactly once
    unsafe { ptr::drop_in_place(p.cast::<F>()) }
}

fn vtable_of<F: FnOnce()>() -> &'static InlineVtable {
    &InlineVtable {
        invoke: invoke_inline::<F>,
        drop_in_place: drop_inline::<F>,
    }
}

enum Slot {
    Empty,
    Inline(&'static InlineVtable),
    Boxed(Box<dyn FnOnce() + Send>),
}

/// Run-exactly-once closure holder with small-buffer optimization.
pub struct CoroAction {
    buffer: InlineBuf,
    slot: Slot,
}

// The inline buffer only ever holds `Send` closures.
unsafe impl Send for CoroAction {}

impl CoroAction {
    pub fn new() -> Self {
        Self {
            buffer: InlineBuf([MaybeUninit::uninit(); INLINE_SIZE]),
            slot: Slot::Empty,
        }
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self.slot, Slot::Empty)
    }

    /// Arms the action. The previous closure must have been run (or the
    /// action never loaded); silently overwriting a pending closure is a
    /// bug in the scheduler.
    pub fn reset<F: FnOnce() + Send + 'static>(&mut self, f: F) {
        debug_assert!(!self.is_loaded(), "re-armed an action with a pending closure");
        if mem::size_of::<F>() <= INLINE_SIZE && mem::align_of::<F>() <= mem::align_of::<InlineBuf>()
        {
            // SAFETY: size and alignment were just checked
            unsafe {
                ptr::write(self.buffer.0.as_mut_ptr().cast::<F>(), f);
            }
            self.slot = Slot::Inline(vtable_of::<F>());
        } else {
            self.slot = Slot::Boxed(Box::new(f));
        }
    }

    /// Runs the stored closure, leaving the action empty.
    pub fn run(&mut self) {
        match mem::replace(&mut self.slot, Slot::Empty) {
            Slot::Empty => panic!("ran an empty coroutine action"),
            // SAFETY: the slot said the buffer holds a closure of the
            // vtable's type; taking the slot first makes this a move
            Slot::Inline(vt) => unsafe { (vt.invoke)(self.buffer.0.as_mut_ptr().cast()) },
            Slot::Boxed(f) => f(),
        }
    }
}

impl Default for CoroAction {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CoroAction {
    fn drop(&mut self) {
        if let Slot::Inline(vt) = mem::replace(&mut self.slot, Slot::Empty) {
            // never-run inline closure still owns its captures
            // SAFETY: buffer holds a valid closure of the vtable's type
            unsafe { (vt.drop_in_place)(self.buffer.0.as_mut_ptr().cast()) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn small_closure_runs_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut action = CoroAction::new();
        let c = Arc::clone(&counter);
        action.reset(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        assert!(matches!(action.slot, Slot::Inline(_)));
        action.run();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(!action.is_loaded());
    }

    #[test]
    fn large_closure_is_boxed() {
        let big = [0u8; 512];
        let mut action = CoroAction::new();
        action.reset(move || {
            std::hint::black_box(&big);
        });
        assert!(matches!(action.slot, Slot::Boxed(_)));
        action.run();
    }

    #[test]
    fn reuse_after_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut action = CoroAction::new();
        for _ in 0..3 {
            let c = Arc::clone(&counter);
            action.reset(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
            action.run();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn dropping_unrun_closure_releases_captures() {
        let payload = Arc::new(());
        let witness = Arc::downgrade(&payload);
        {
            let mut action = CoroAction::new();
            action.reset(move || {
                drop(payload);
            });
        }
        assert!(witness.upgrade().is_none());
    }

    #[test]
    #[should_panic(expected = "ran an empty coroutine action")]
    fn running_empty_action_panics() {
        CoroAction::new().run();
    }
}
