//! # Coroutines
//!
//! A coroutine is a cooperatively scheduled execution with its own stack,
//! pinned to a *home* worker thread. Everything here is driven by two
//! hand-offs:
//!
//! - the scheduler *resumes* a coroutine (the single resumption site is
//!   the worker loop in `runtime.rs`), and
//! - the coroutine *suspends* back, leaving a [`Suspend`] reason for the
//!   scheduler.
//!
//! All post-suspend bookkeeping — requeueing after a yield, re-homing
//! after a migration, returning a finished coroutine to the pool —
//! happens on the scheduler side, strictly *after* the coroutine's
//! context is saved. That ordering is what makes cross-thread wakeups
//! safe: no other worker can observe a coroutine as runnable while its
//! registers are still live on some stack.
//!
//! ## The wait/notify protocol
//!
//! `wait()` parks until exactly one notify. The race between a notify
//! and the act of going to sleep is resolved with two atomics:
//!
//! - a notifier first sets `notified`, then tries to move the state from
//!   `Waiting` to `Queued`; only the winner of that CAS enqueues.
//! - the scheduler, after saving the context of a coroutine that asked to
//!   wait, stores `Waiting` and *re-checks* `notified`; if a notify
//!   slipped in while the coroutine was still `Running`, the scheduler
//!   performs the wakeup itself.
//! - `wait()` consumes the flag on both of its exits: the fast path
//!   absorbs a notify that already landed, and the resumed path clears
//!   the flag the waking notify set before it won the CAS. One notify,
//!   one wait — a stale flag would make the next `wait()` fall through.
//!
//! A notify that arrives before `wait()` is absorbed by the flag and
//! `wait()` returns without suspending. Notifies coalesce: the flag is a
//! flag, not a counter, and anything that lands between a wakeup and the
//! waiter actually resuming folds into that wakeup.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::mem;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::config::{CORO_FREE_LIST_MAX, DEFAULT_STACK_SIZE, MIN_STACK_HEADROOM};
use crate::coro::action::CoroAction;
use crate::coro::context::{self, CoroContext};
use crate::coro::runtime::SchedulerRegistry;
use crate::coro::stack::Stack;

pub(crate) const STATE_FRESH: u8 = 0;
pub(crate) const STATE_QUEUED: u8 = 1;
pub(crate) const STATE_RUNNING: u8 = 2;
pub(crate) const STATE_WAITING: u8 = 3;
pub(crate) const STATE_FINISHED: u8 = 4;

/// Why a coroutine handed control back to its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspend {
    /// Requeue on the current worker.
    Yield,
    /// Park until notified.
    Wait,
    /// Requeue on another worker.
    Migrate(usize),
    /// The action ran to completion.
    Finish,
}

static NEXT_CORO_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Coro {
    id: u64,
    state: AtomicU8,
    notified: AtomicBool,
    home_thread: AtomicUsize,
    /// Non-zero priority coroutines take the head of the queue whenever
    /// the scheduler or a notifier wakes them.
    priority: AtomicU8,
    registry: Weak<SchedulerRegistry>,
    // The cells below are only touched by the thread that currently owns
    // the coroutine: its home worker while suspended/queued, the running
    // thread while live. The state machine serializes those phases.
    stack: UnsafeCell<Stack>,
    context: UnsafeCell<CoroContext>,
    action: UnsafeCell<CoroAction>,
    #[cfg(debug_assertions)]
    spawned_from: parking_lot::Mutex<Option<std::backtrace::Backtrace>>,
}

// See the cell comment above; cross-thread access is serialized by the
// state machine and the queue locks.
unsafe impl Send for Coro {}
unsafe impl Sync for Coro {}

impl Coro {
    /// Allocates a coroutine with a fresh stack and an armed guard page.
    pub(crate) fn fresh(registry: &Arc<SchedulerRegistry>, home: usize) -> Arc<Coro> {
        let mut stack = Stack::new(DEFAULT_STACK_SIZE);
        stack.enable_overflow_protection();
        let context = stack.init_frame(coro_entry);
        Arc::new(Coro {
            id: NEXT_CORO_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(STATE_FRESH),
            notified: AtomicBool::new(false),
            home_thread: AtomicUsize::new(home),
            priority: AtomicU8::new(0),
            registry: Arc::downgrade(registry),
            stack: UnsafeCell::new(stack),
            context: UnsafeCell::new(context),
            action: UnsafeCell::new(CoroAction::new()),
            #[cfg(debug_assertions)]
            spawned_from: parking_lot::Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
    }

    pub(crate) fn home_thread(&self) -> usize {
        self.home_thread.load(Ordering::SeqCst)
    }

    pub(crate) fn set_home_thread(&self, thread: usize) {
        self.home_thread.store(thread, Ordering::SeqCst);
    }

    pub(crate) fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    /// Whether wakeups of this coroutine should jump the queue.
    pub(crate) fn wakes_urgently(&self) -> bool {
        self.priority.load(Ordering::SeqCst) != 0
    }

    /// Arms the action and records the spawn site (debug builds). The
    /// caller must own the coroutine (fresh, or taken from the pool).
    pub(crate) fn arm<F: FnOnce() + Send + 'static>(&self, f: F) {
        // SAFETY: exclusive ownership per the cell comment
        unsafe { (*self.action.get()).reset(f) };
        #[cfg(debug_assertions)]
        {
            *self.spawned_from.lock() = Some(std::backtrace::Backtrace::capture());
        }
    }

    /// Scheduler-side wakeup check after parking a waiter: a notify that
    /// landed while the coroutine was still running wins now.
    pub(crate) fn consume_pending_notify(&self) -> bool {
        self.notified.swap(false, Ordering::SeqCst)
            && self
                .state
                .compare_exchange(
                    STATE_WAITING,
                    STATE_QUEUED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
    }

    /// Guard-page bookkeeping around the free list.
    pub(crate) fn disarm_stack(&self) {
        // SAFETY: exclusive ownership (coroutine just finished on this thread)
        unsafe { (*self.stack.get()).disable_overflow_protection() };
    }

    pub(crate) fn rearm_stack(&self) {
        // SAFETY: exclusive ownership (taken from this thread's pool)
        unsafe { (*self.stack.get()).enable_overflow_protection() };
    }
}

impl Drop for Coro {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::SeqCst);
        if state == STATE_RUNNING || state == STATE_WAITING {
            panic!("dropped live coroutine {}", self.id);
        }
        // Fresh/pooled coroutines park at a quiescent point; their
        // contexts can be abandoned with the stack.
        let context = mem::replace(self.context.get_mut(), CoroContext::nil());
        if !context.is_nil() {
            context.discard();
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Coro>>> = const { RefCell::new(None) };
    static SCHED_CONTEXT: UnsafeCell<CoroContext> = const { UnsafeCell::new(CoroContext::nil()) };
    static PENDING: Cell<Option<Suspend>> = const { Cell::new(None) };
    static WORKER: RefCell<Option<WorkerHandle>> = const { RefCell::new(None) };
    static FREE_LIST: RefCell<Vec<Arc<Coro>>> = const { RefCell::new(Vec::new()) };
}

#[derive(Clone)]
pub(crate) struct WorkerHandle {
    pub(crate) registry: Arc<SchedulerRegistry>,
    pub(crate) index: usize,
}

pub(crate) fn install_worker(handle: WorkerHandle) {
    WORKER.with(|w| *w.borrow_mut() = Some(handle));
}

pub(crate) fn current_worker() -> Option<WorkerHandle> {
    WORKER.with(|w| w.borrow().clone())
}

fn current_coro() -> Option<Arc<Coro>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Hands control to the scheduler with `reason`. Returns when the
/// scheduler (possibly on another thread, after a migration) resumes us.
pub(crate) fn suspend(reason: Suspend) {
    let coro = current_coro().expect("suspend outside a coroutine");
    PENDING.with(|p| p.set(Some(reason)));
    let sched = SCHED_CONTEXT.with(|c| {
        // SAFETY: the slot is only touched by code on this thread, and
        // never concurrently (scheduler and coroutine alternate)
        unsafe { mem::replace(&mut *c.get(), CoroContext::nil()) }
    });
    assert!(!sched.is_nil(), "no scheduler context to suspend into");
    // SAFETY: we own our context cell while running
    unsafe { context::switch(&mut *coro.context.get(), sched) };
}

/// Runs `coro` until it suspends. The single resumption site; only the
/// worker loop calls this.
pub(crate) fn resume(coro: Arc<Coro>) -> Suspend {
    coro.set_state(STATE_RUNNING);
    CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&coro)));
    // SAFETY: the coroutine is suspended, so its context cell is ours
    let target = unsafe { mem::replace(&mut *coro.context.get(), CoroContext::nil()) };
    assert!(!target.is_nil(), "resumed coroutine {} without a context", coro.id);
    SCHED_CONTEXT.with(|c| {
        // SAFETY: same single-thread alternation as in suspend()
        unsafe { context::switch(&mut *c.get(), target) }
    });
    CURRENT.with(|c| *c.borrow_mut() = None);
    PENDING
        .with(|p| p.take())
        .expect("coroutine suspended without a reason")
}

/// Entry point of every coroutine stack. Loops so pooled coroutines can
/// be re-armed and resumed without rebuilding their frame.
extern "C" fn coro_entry() -> ! {
    loop {
        let coro = current_coro().expect("coroutine entry without a current coroutine");
        trace!(coro = coro.id, "coroutine starting");
        // SAFETY: the running coroutine owns its action cell
        let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { (*coro.action.get()).run() }));
        if let Err(payload) = outcome {
            // unwinding through the fabricated root frame is undefined;
            // a stray panic in a coroutine is fatal
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            eprintln!("coroutine {} panicked: {}", coro.id, msg);
            std::process::abort();
        }
        trace!(coro = coro.id, "coroutine finished");
        drop(coro);
        suspend(Suspend::Finish);
    }
}

/// Takes a pooled coroutine from this worker's free list, or allocates a
/// fresh one.
pub(crate) fn obtain_coro(worker: &WorkerHandle) -> Arc<Coro> {
    let pooled = FREE_LIST.with(|fl| fl.borrow_mut().pop());
    match pooled {
        Some(coro) => {
            coro.rearm_stack();
            coro.set_home_thread(worker.index);
            // a notify addressed to the slot's previous occupant (before
            // or after it was pooled) does not carry over
            coro.notified.store(false, Ordering::SeqCst);
            coro
        }
        None => Coro::fresh(&worker.registry, worker.index),
    }
}

/// Returns a finished coroutine to this worker's pool, or drops it if
/// the pool is full.
pub(crate) fn recycle_coro(coro: Arc<Coro>) {
    coro.disarm_stack();
    FREE_LIST.with(|fl| {
        let mut fl = fl.borrow_mut();
        if fl.len() < CORO_FREE_LIST_MAX {
            fl.push(coro);
        }
    });
}

/// Shared handle to a coroutine, used to notify it or move it between
/// worker threads. Cheap to clone; safe to use from any runtime thread.
#[derive(Clone)]
pub struct CoroHandle {
    coro: Arc<Coro>,
}

impl CoroHandle {
    pub fn id(&self) -> u64 {
        self.coro.id()
    }

    /// Wakes the target and immediately yields to it if it lives on the
    /// caller's worker, so it runs before anything else queued here.
    pub fn notify_now(&self) {
        let woke = notify(&self.coro, true);
        let same_worker = current_worker()
            .map(|w| w.index == self.coro.home_thread())
            .unwrap_or(false);
        if woke && same_worker && current_coro().is_some() {
            suspend(Suspend::Yield);
        }
    }

    /// Wakes the target with no ordering promise.
    pub fn notify_sometime(&self) {
        notify(&self.coro, false);
    }

    /// Wakes the target; wakeups issued this way from one thread reach
    /// the target's queue in issue order.
    pub fn notify_later_ordered(&self) {
        notify(&self.coro, false);
    }
}

/// Returns whether this call performed the wakeup (false: the target was
/// not waiting, the flag will be absorbed by its next wait).
fn notify(coro: &Arc<Coro>, urgent: bool) -> bool {
    let urgent = urgent || coro.wakes_urgently();
    coro.notified.store(true, Ordering::SeqCst);
    let woke = coro
        .state
        .compare_exchange(
            STATE_WAITING,
            STATE_QUEUED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok();
    if woke {
        let registry = coro
            .registry
            .upgrade()
            .expect("notify after the runtime shut down");
        registry.enqueue(coro.home_thread(), Arc::clone(coro), urgent);
    }
    woke
}

/// Handle to the currently running coroutine. `None` on non-coroutine
/// threads.
pub fn current() -> Option<CoroHandle> {
    current_coro().map(|coro| CoroHandle { coro })
}

/// Suspends until one notify arrives. A notify that already arrived is
/// absorbed immediately. Fatal outside a coroutine.
pub fn wait() {
    let coro = current_coro().expect("wait() outside a coroutine");
    if coro.notified.swap(false, Ordering::SeqCst) {
        return;
    }
    suspend(Suspend::Wait);
    // the waking notify set the flag before winning its CAS; consume it
    // here so the next wait() parks again. A notify landing between the
    // wakeup and this point coalesces into the one being delivered.
    coro.notified.store(false, Ordering::SeqCst);
}

/// Reschedules the current coroutine behind everything already queued on
/// its worker.
pub fn yield_now() {
    suspend(Suspend::Yield);
}

/// Like [`yield_now`], and additionally FIFO-ordered against other
/// ordered yielders on the same worker.
pub fn yield_ordered() {
    suspend(Suspend::Yield);
}

fn spawn_with<F: FnOnce() + Send + 'static>(f: F, urgent: bool) -> CoroHandle {
    let worker = current_worker().expect("spawn outside the coroutine runtime");
    let coro = obtain_coro(&worker);
    coro.arm(f);
    coro.set_priority(urgent as u8);
    debug!(coro = coro.id(), worker = worker.index, "spawned coroutine");
    worker.registry.live_count_incr();
    coro.set_state(STATE_QUEUED);
    worker
        .registry
        .enqueue(worker.index, Arc::clone(&coro), urgent);
    CoroHandle { coro }
}

/// Spawns at the head of this worker's queue and yields into it: the
/// caller is suspended until the new coroutine suspends or finishes.
pub fn spawn_now<F: FnOnce() + Send + 'static>(f: F) -> CoroHandle {
    let handle = spawn_with(f, true);
    if current_coro().is_some() {
        suspend(Suspend::Yield);
    }
    handle
}

/// Spawns with no ordering promise against the caller.
pub fn spawn_sometime<F: FnOnce() + Send + 'static>(f: F) -> CoroHandle {
    spawn_with(f, false)
}

/// Spawns behind everything queued so far; spawns issued this way from
/// one thread start in issue order.
pub fn spawn_later_ordered<F: FnOnce() + Send + 'static>(f: F) -> CoroHandle {
    spawn_with(f, false)
}

/// Migrates the current coroutine to worker `target`. The hand-off goes
/// through the scheduler: the context is fully saved on this thread
/// before the target worker can see the coroutine.
pub fn move_to_thread(target: usize) {
    let coro = current_coro().expect("move_to_thread outside a coroutine");
    let worker = current_worker().expect("coroutine running outside a worker");
    assert!(
        target < worker.registry.worker_count(),
        "move_to_thread({}) beyond the {} configured workers",
        target,
        worker.registry.worker_count()
    );
    if worker.index == target {
        return;
    }
    coro.set_home_thread(target);
    suspend(Suspend::Migrate(target));
}

/// Runs the closure on worker `target` for the guard's lifetime,
/// migrating back on drop.
pub struct OnThread {
    original: usize,
}

impl OnThread {
    pub fn new(target: usize) -> OnThread {
        let original = current_worker()
            .expect("OnThread outside the coroutine runtime")
            .index;
        move_to_thread(target);
        OnThread { original }
    }
}

impl Drop for OnThread {
    fn drop(&mut self) {
        move_to_thread(self.original);
    }
}

/// Runs `f`, escaping to a fresh coroutine (with a full, empty stack)
/// when fewer than `min_bytes` of stack remain here. The escape blocks
/// the caller until `f` completes and forwards its return value — and
/// its panic, if it panics. Outside a coroutine, `f` runs directly.
pub fn call_with_enough_stack<R: Send, F: FnOnce() -> R + Send>(f: F, min_bytes: usize) -> R {
    let Some(coro) = current_coro() else {
        return f();
    };

    let probe: u8 = 0;
    // SAFETY: the running coroutine owns its stack cell
    let headroom = unsafe { (*coro.stack.get()).free_space_below(&probe as *const u8) };
    if headroom >= min_bytes.max(MIN_STACK_HEADROOM) {
        return f();
    }
    drop(coro);

    let caller = current().expect("checked above");
    let mut result: Option<std::thread::Result<R>> = None;
    let result_ptr = &mut result as *mut Option<std::thread::Result<R>> as usize;

    {
        let closure = move || {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            // SAFETY: the caller's frame outlives this coroutine; it is
            // parked in wait() below until we notify it
            unsafe {
                *(result_ptr as *mut Option<std::thread::Result<R>>) = Some(outcome);
            }
            caller.notify_sometime();
        };
        // SAFETY: lifetime erasure justified by the wait() below — the
        // borrowed environment cannot move or die while we are parked
        let boxed: Box<dyn FnOnce() + Send> = unsafe {
            mem::transmute::<Box<dyn FnOnce() + Send + '_>, Box<dyn FnOnce() + Send + 'static>>(
                Box::new(closure),
            )
        };
        spawn_now(boxed);
    }
    wait();

    match result.take().expect("stack-escape coroutine never reported") {
        Ok(value) => value,
        Err(payload) => resume_unwind(payload),
    }
}

/// Scheduling TLS of one thread, bundled for transport. The threaded
/// fallback runs every coroutine on its own OS thread, so the state that
/// is thread-local here (current coroutine, worker handle, suspend
/// reason, scheduler context) must travel with control across a switch.
#[cfg(any(
    feature = "threaded-coroutines",
    not(any(target_arch = "x86_64", target_arch = "aarch64"))
))]
pub(crate) struct TlsShuttle {
    current: Option<Arc<Coro>>,
    worker: Option<WorkerHandle>,
    pending: Option<Suspend>,
    sched_context: CoroContext,
}

#[cfg(any(
    feature = "threaded-coroutines",
    not(any(target_arch = "x86_64", target_arch = "aarch64"))
))]
impl Default for TlsShuttle {
    fn default() -> Self {
        TlsShuttle {
            current: None,
            worker: None,
            pending: None,
            sched_context: CoroContext::nil(),
        }
    }
}

/// Strips this thread's scheduling TLS for transport to the thread that
/// control is about to move to.
#[cfg(any(
    feature = "threaded-coroutines",
    not(any(target_arch = "x86_64", target_arch = "aarch64"))
))]
pub(crate) fn export_tls() -> TlsShuttle {
    TlsShuttle {
        current: CURRENT.with(|c| c.borrow_mut().take()),
        worker: WORKER.with(|w| w.borrow_mut().take()),
        pending: PENDING.with(|p| p.take()),
        sched_context: SCHED_CONTEXT.with(|c| {
            // SAFETY: single-thread alternation, as in suspend()
            unsafe { mem::replace(&mut *c.get(), CoroContext::nil()) }
        }),
    }
}

/// Installs scheduling TLS exported by the thread control came from.
#[cfg(any(
    feature = "threaded-coroutines",
    not(any(target_arch = "x86_64", target_arch = "aarch64"))
))]
pub(crate) fn import_tls(shuttle: TlsShuttle) {
    CURRENT.with(|c| *c.borrow_mut() = shuttle.current);
    WORKER.with(|w| *w.borrow_mut() = shuttle.worker);
    PENDING.with(|p| p.set(shuttle.pending));
    SCHED_CONTEXT.with(|c| {
        // SAFETY: single-thread alternation, as in suspend()
        let old = unsafe { mem::replace(&mut *c.get(), shuttle.sched_context) };
        debug_assert!(old.is_nil(), "imported TLS over a live scheduler context");
        drop(old);
    });
}
