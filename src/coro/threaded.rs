//! # Threaded Context Fallback
//!
//! Drop-in replacement for the naked-asm context switch, used on
//! architectures without a hand-written switch and under the
//! `threaded-coroutines` feature (which makes every coroutine frame
//! visible to debuggers and sanitizers as an ordinary thread).
//!
//! Each context is a parked OS thread. A switch wakes the target thread,
//! then parks the current one; at most one of the runtime's threads is
//! ever awake per worker, preserving the cooperative execution model.
//! Because the "coroutine" now runs on a thread of its own, the
//! scheduling TLS travels with control: the outgoing thread exports it
//! into the hand-off and the incoming thread installs it before running
//! (see `TlsShuttle` in `coroutine.rs`).
//!
//! [`CoroContext::discard`] only releases threads parked at birth (fresh
//! frames that never ran). A pooled coroutine parked mid-loop keeps its
//! thread parked forever; that leak is accepted in this debugging mode.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::coro::coroutine::{export_tls, import_tls, TlsShuttle};

#[derive(Default)]
struct Signal {
    go: bool,
    exit: bool,
    shuttle: Option<TlsShuttle>,
}

#[derive(Default)]
struct ParkPoint {
    signal: Mutex<Signal>,
    wakeup: Condvar,
}

impl ParkPoint {
    /// Wakes the parked thread, handing it the outgoing thread's TLS.
    fn release(&self, shuttle: TlsShuttle) {
        let mut signal = self.signal.lock();
        signal.go = true;
        signal.shuttle = Some(shuttle);
        self.wakeup.notify_one();
    }

    fn release_for_exit(&self) {
        let mut signal = self.signal.lock();
        signal.exit = true;
        self.wakeup.notify_one();
    }

    /// Parks until released. Exit signals are ignored here; only the
    /// birth park honors them.
    fn park(&self) -> TlsShuttle {
        let mut signal = self.signal.lock();
        while !signal.go {
            self.wakeup.wait(&mut signal);
        }
        signal.go = false;
        signal.shuttle.take().unwrap_or_default()
    }

    /// The park a fresh thread is born into. Returns `None` on exit.
    fn park_at_birth(&self) -> Option<TlsShuttle> {
        let mut signal = self.signal.lock();
        loop {
            if signal.exit {
                return None;
            }
            if signal.go {
                signal.go = false;
                return Some(signal.shuttle.take().unwrap_or_default());
            }
            self.wakeup.wait(&mut signal);
        }
    }
}

/// Saved execution state: a parked thread waiting to be released.
/// Resumable exactly once; dropping a live context is a fatal error.
pub struct CoroContext {
    point: Option<Arc<ParkPoint>>,
}

impl CoroContext {
    pub const fn nil() -> Self {
        Self { point: None }
    }

    pub fn is_nil(&self) -> bool {
        self.point.is_none()
    }

    /// Abandons a live context without resuming it. Threads parked at
    /// birth exit; threads parked mid-execution stay parked (leaked).
    pub(crate) fn discard(mut self) {
        if let Some(point) = self.point.take() {
            point.release_for_exit();
        }
    }
}

impl Default for CoroContext {
    fn default() -> Self {
        Self::nil()
    }
}

impl Drop for CoroContext {
    fn drop(&mut self) {
        if !self.is_nil() {
            panic!("dropped a live coroutine context");
        }
    }
}

/// Suspends the current execution into `save` and resumes `target`:
/// wakes the target's thread with this thread's scheduling TLS, then
/// parks until some later switch releases the saved context.
pub(crate) fn switch(save: &mut CoroContext, target: CoroContext) {
    assert!(save.is_nil(), "switch would overwrite a live context");
    let mut target = target;
    let target_point = match target.point.take() {
        Some(point) => point,
        None => panic!("switch into a nil context"),
    };

    let own = Arc::new(ParkPoint::default());
    save.point = Some(Arc::clone(&own));

    target_point.release(export_tls());
    let incoming = own.park();
    import_tls(incoming);
}

/// Fabricates a fresh context: an OS thread parked at birth that will run
/// `entry` once first resumed. The stack argument is unused; the thread
/// brings its own.
pub(crate) fn init_frame(_stack_top: *mut u8, entry: extern "C" fn() -> !) -> CoroContext {
    let point = Arc::new(ParkPoint::default());
    let birth_point = Arc::clone(&point);
    std::thread::Builder::new()
        .name("burrow-coro".to_string())
        .spawn(move || {
            if let Some(shuttle) = birth_point.park_at_birth() {
                import_tls(shuttle);
                entry();
            }
        })
        .unwrap_or_else(|e| panic!("failed to spawn coroutine thread: {e}"));
    CoroContext { point: Some(point) }
}
