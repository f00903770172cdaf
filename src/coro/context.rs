//! # Context Switching
//!
//! A [`CoroContext`] is a resumption capsule: either *nil* (empty) or
//! *live* (a saved stack pointer that can be resumed exactly once). The
//! switch itself is a short naked-asm routine that saves the callee-saved
//! registers and the stack pointer, installs the target's stack pointer,
//! restores its registers, and returns — "returning" into whatever call
//! frame the target context saved itself from.
//!
//! Only callee-saved integer registers travel with a context. Floating
//! point and SIMD state is caller-saved under both supported ABIs, and
//! the signal mask is deliberately left alone: saving it would add two
//! syscalls per switch, and all coroutines of a worker share the worker
//! thread's mask anyway.
//!
//! ## Initial frames
//!
//! [`init_frame`] fabricates the frame a fresh coroutine "saved itself
//! from": zeroes for the callee-saved registers and the entry function
//! where the resume path expects a return address (x86_64) or the saved
//! link register (aarch64). The entry function therefore starts exactly
//! as if it had been called, with the ABI-required stack alignment.
//!
//! ```text
//! x86_64 fresh frame (top = 16-aligned stack top):
//!   [top -  8]  0            fake return address for the entry frame
//!   [top - 16]  entry        consumed by `ret`
//!   [top - 64]  6 x 0        popped into r15,r14,r13,r12,rbx,rbp
//!   saved sp = top - 64
//!
//! aarch64 fresh frame:
//!   [sp0 + 88]  entry        loaded into x30; `ret` jumps there
//!   [sp0 +  0]  11 x 0       x19..x28, x29
//!   saved sp = sp0 = top - 96
//! ```

use std::mem;

/// Saved execution state. Resumable exactly once; dropping a live context
/// is a fatal error.
#[repr(transparent)]
pub struct CoroContext {
    sp: *mut u8,
}

// A context only travels between threads while suspended; the scheduler
// protocol guarantees a single resumer.
unsafe impl Send for CoroContext {}

impl CoroContext {
    pub const fn nil() -> Self {
        Self {
            sp: std::ptr::null_mut(),
        }
    }

    pub fn is_nil(&self) -> bool {
        self.sp.is_null()
    }

    /// Abandons a live context without resuming it. Only valid for
    /// contexts parked at a quiescent point that owns no resources beyond
    /// its stack (fresh frames and finished coroutines in the pool).
    pub(crate) fn discard(mut self) {
        self.sp = std::ptr::null_mut();
    }
}

impl Drop for CoroContext {
    fn drop(&mut self) {
        if !self.is_nil() {
            panic!("dropped a live coroutine context");
        }
    }
}

/// Suspends the current execution into `save` and resumes `target`. When
/// some later switch resumes the saved context, this call returns; by
/// then the resumer has already taken the context back out of `save`.
pub(crate) fn switch(save: &mut CoroContext, target: CoroContext) {
    assert!(save.is_nil(), "switch would overwrite a live context");
    assert!(!target.is_nil(), "switch into a nil context");
    let load = target.sp;
    mem::forget(target);
    // SAFETY: `load` came from a live context, which is only ever
    // produced by init_frame or a previous switch on a valid stack
    unsafe { switch_stacks(&mut save.sp, load) }
}

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn switch_stacks(save_sp: *mut *mut u8, load_sp: *mut u8) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn switch_stacks(save_sp: *mut *mut u8, load_sp: *mut u8) {
    core::arch::naked_asm!(
        "sub sp, sp, #96",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "mov x2, sp",
        "str x2, [x0]",
        "mov sp, x1",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "add sp, sp, #96",
        "ret",
    )
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn init_frame(stack_top: *mut u8, entry: extern "C" fn() -> !) -> CoroContext {
    let top = (stack_top as usize) & !15;
    // SAFETY: all writes land inside the stack the caller owns
    unsafe {
        let word = |offset: usize| (top - offset) as *mut usize;
        word(8).write(0); // fake return address above the entry frame
        word(16).write(entry as usize);
        for offset in [24, 32, 40, 48, 56, 64] {
            word(offset).write(0);
        }
        CoroContext {
            sp: (top - 64) as *mut u8,
        }
    }
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn init_frame(stack_top: *mut u8, entry: extern "C" fn() -> !) -> CoroContext {
    let top = (stack_top as usize) & !15;
    let sp0 = top - 96;
    // SAFETY: all writes land inside the stack the caller owns
    unsafe {
        for offset in (0..88).step_by(8) {
            ((sp0 + offset) as *mut usize).write(0);
        }
        ((sp0 + 88) as *mut usize).write(entry as usize); // saved x30
        CoroContext { sp: sp0 as *mut u8 }
    }
}
