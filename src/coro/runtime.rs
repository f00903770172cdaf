//! # The Coroutine Runtime
//!
//! A [`Runtime`] owns a fixed set of worker threads. Each worker runs a
//! scheduler loop over its own queue of runnable coroutines: pop, resume,
//! act on the [`Suspend`] reason, repeat. The loop is the only place a
//! coroutine is ever resumed from, and all state transitions that make a
//! coroutine visible to other workers happen here, after its context has
//! been saved.
//!
//! [`Runtime::run`] injects a root coroutine and blocks the calling
//! (non-worker) thread until the runtime is quiescent: the root coroutine
//! and everything transitively spawned from it have finished. Quiescence
//! is tracked by a live-coroutine counter; the worker that drives it to
//! zero signals the condvar `run` sleeps on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::coro::coroutine::{
    install_worker, recycle_coro, resume, Coro, Suspend, WorkerHandle, STATE_FINISHED,
    STATE_QUEUED, STATE_WAITING,
};

pub(crate) struct Worker {
    index: usize,
    queue: Mutex<VecDeque<Arc<Coro>>>,
    wakeup: Condvar,
}

impl Worker {
    fn new(index: usize) -> Worker {
        Worker {
            index,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
        }
    }

    fn enqueue(&self, coro: Arc<Coro>, urgent: bool) {
        trace!(coro = coro.id(), worker = self.index, urgent, "enqueued");
        let mut queue = self.queue.lock();
        if urgent {
            queue.push_front(coro);
        } else {
            queue.push_back(coro);
        }
        self.wakeup.notify_one();
    }
}

pub(crate) struct SchedulerRegistry {
    workers: Vec<Arc<Worker>>,
    live_count: AtomicUsize,
    shutdown: AtomicBool,
    quiesce_lock: Mutex<()>,
    quiesce: Condvar,
}

impl SchedulerRegistry {
    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn enqueue(&self, thread: usize, coro: Arc<Coro>, urgent: bool) {
        self.workers[thread].enqueue(coro, urgent);
    }

    pub(crate) fn live_count_incr(&self) {
        self.live_count.fetch_add(1, Ordering::SeqCst);
    }

    fn live_count_decr(&self) {
        if self.live_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            // taking the lock orders this signal against the check in run()
            let _guard = self.quiesce_lock.lock();
            self.quiesce.notify_all();
        }
    }
}

fn scheduler_main(registry: Arc<SchedulerRegistry>, index: usize) {
    install_worker(WorkerHandle {
        registry: Arc::clone(&registry),
        index,
    });
    let worker = Arc::clone(&registry.workers[index]);

    loop {
        let next = {
            let mut queue = worker.queue.lock();
            loop {
                if let Some(coro) = queue.pop_front() {
                    break Some(coro);
                }
                if registry.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                worker.wakeup.wait(&mut queue);
            }
        };
        let Some(coro) = next else {
            break;
        };

        match resume(Arc::clone(&coro)) {
            Suspend::Yield => {
                coro.set_state(STATE_QUEUED);
                worker.enqueue(coro, false);
            }
            Suspend::Wait => {
                coro.set_state(STATE_WAITING);
                // a notify that landed while the coroutine was still
                // running could not enqueue; perform its wakeup now
                if coro.consume_pending_notify() {
                    let urgent = coro.wakes_urgently();
                    registry.enqueue(coro.home_thread(), coro, urgent);
                }
            }
            Suspend::Migrate(target) => {
                coro.set_state(STATE_QUEUED);
                let urgent = coro.wakes_urgently();
                registry.enqueue(target, coro, urgent);
            }
            Suspend::Finish => {
                debug!(coro = coro.id(), worker = index, "coroutine finished");
                coro.set_state(STATE_FINISHED);
                recycle_coro(coro);
                registry.live_count_decr();
            }
        }
    }
}

/// Fixed pool of cooperative worker threads.
pub struct Runtime {
    registry: Arc<SchedulerRegistry>,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn new(threads: usize) -> Runtime {
        assert!(threads >= 1, "a runtime needs at least one worker thread");
        let registry = Arc::new(SchedulerRegistry {
            workers: (0..threads).map(|i| Arc::new(Worker::new(i))).collect(),
            live_count: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            quiesce_lock: Mutex::new(()),
            quiesce: Condvar::new(),
        });
        let handles = (0..threads)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::Builder::new()
                    .name(format!("burrow-worker-{i}"))
                    .spawn(move || scheduler_main(registry, i))
                    .unwrap_or_else(|e| panic!("failed to spawn worker thread {i}: {e}"))
            })
            .collect();
        Runtime { registry, handles }
    }

    /// Runs `f` as a coroutine on worker 0 and blocks until the runtime
    /// is quiescent again: `f` and every coroutine spawned (transitively)
    /// from it have finished.
    pub fn run<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.registry.live_count_incr();
        let coro = Coro::fresh(&self.registry, 0);
        coro.arm(f);
        coro.set_state(STATE_QUEUED);
        self.registry.enqueue(0, coro, false);

        let mut guard = self.registry.quiesce_lock.lock();
        while self.registry.live_count.load(Ordering::SeqCst) != 0 {
            self.registry.quiesce.wait(&mut guard);
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.registry.shutdown.store(true, Ordering::SeqCst);
        for worker in &self.registry.workers {
            // grab the queue lock so the store is not missed between a
            // worker's empty-check and its wait
            drop(worker.queue.lock());
            worker.wakeup.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::{
        call_with_enough_stack, current, move_to_thread, spawn_later_ordered, spawn_now,
        spawn_sometime, wait, yield_now, OnThread,
    };
    use std::sync::atomic::AtomicU64;

    #[test]
    fn run_executes_the_closure() {
        let runtime = Runtime::new(1);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        runtime.run(move || {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn run_waits_for_spawned_coroutines() {
        let runtime = Runtime::new(1);
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        runtime.run(move || {
            for _ in 0..10 {
                let c = Arc::clone(&c);
                spawn_sometime(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn spawn_now_runs_before_the_spawner_continues() {
        let runtime = Runtime::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&log);
        runtime.run(move || {
            let inner = Arc::clone(&outer);
            spawn_now(move || {
                inner.lock().push("child");
            });
            outer.lock().push("parent");
        });
        assert_eq!(*log.lock(), vec!["child", "parent"]);
    }

    #[test]
    fn wait_parks_until_notified() {
        let runtime = Runtime::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&log);
        runtime.run(move || {
            let waiter_log = Arc::clone(&outer);
            let waiter = spawn_sometime(move || {
                wait();
                waiter_log.lock().push("woken");
            });
            outer.lock().push("notifying");
            yield_now(); // let the waiter reach its wait()
            waiter.notify_sometime();
        });
        assert_eq!(*log.lock(), vec!["notifying", "woken"]);
    }

    #[test]
    fn early_notify_is_absorbed_by_wait() {
        let runtime = Runtime::new(1);
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        runtime.run(move || {
            let me = current().expect("inside a coroutine");
            me.notify_sometime();
            wait(); // returns immediately, the notify already landed
            flag.store(true, Ordering::SeqCst);
        });
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn yields_interleave_two_coroutines() {
        let runtime = Runtime::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&log);
        runtime.run(move || {
            let a_log = Arc::clone(&outer);
            spawn_later_ordered(move || {
                for _ in 0..3 {
                    a_log.lock().push('a');
                    yield_now();
                }
            });
            let b_log = Arc::clone(&outer);
            spawn_later_ordered(move || {
                for _ in 0..3 {
                    b_log.lock().push('b');
                    yield_now();
                }
            });
        });
        assert_eq!(*log.lock(), vec!['a', 'b', 'a', 'b', 'a', 'b']);
    }

    #[test]
    fn migration_changes_the_worker() {
        let runtime = Runtime::new(2);
        let visited = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&visited);
        runtime.run(move || {
            let here = crate::coro::coroutine::current_worker()
                .expect("inside a worker")
                .index;
            outer.lock().push(here);
            move_to_thread(1);
            let there = crate::coro::coroutine::current_worker()
                .expect("inside a worker")
                .index;
            outer.lock().push(there);
        });
        assert_eq!(*visited.lock(), vec![0, 1]);
    }

    #[test]
    fn on_thread_guard_returns_home() {
        let runtime = Runtime::new(2);
        let visited = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&visited);
        runtime.run(move || {
            {
                let _guard = OnThread::new(1);
                let here = crate::coro::coroutine::current_worker()
                    .expect("inside a worker")
                    .index;
                outer.lock().push(here);
            }
            let back = crate::coro::coroutine::current_worker()
                .expect("inside a worker")
                .index;
            outer.lock().push(back);
        });
        assert_eq!(*visited.lock(), vec![1, 0]);
    }

    #[test]
    fn finished_coroutines_are_reused() {
        let runtime = Runtime::new(1);
        let ids = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&ids);
        runtime.run(move || {
            for _ in 0..4 {
                let ids = Arc::clone(&outer);
                let handle = spawn_now(move || {
                    ids.lock()
                        .push(current().expect("inside a coroutine").id());
                });
                let _ = handle;
            }
        });
        let ids = ids.lock();
        assert_eq!(ids.len(), 4);
        // spawn_now drains each child before the next spawn, so the pool
        // hands the same coroutine back every time
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[test]
    fn pooled_coroutines_do_not_inherit_notifies() {
        let runtime = Runtime::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&log);
        runtime.run(move || {
            let first = spawn_now(|| {});
            first.notify_sometime(); // lands on a finished, pooled coroutine
            let inner = Arc::clone(&outer);
            let second = spawn_sometime(move || {
                wait(); // must park despite the stray notify
                inner.lock().push("woken");
            });
            yield_now(); // the reused coroutine reaches its wait()
            outer.lock().push("notifying");
            second.notify_sometime();
        });
        assert_eq!(*log.lock(), vec!["notifying", "woken"]);
    }

    #[test]
    fn enough_stack_runs_small_calls_in_place() {
        let runtime = Runtime::new(1);
        let result = Arc::new(AtomicU64::new(0));
        let out = Arc::clone(&result);
        runtime.run(move || {
            let value = call_with_enough_stack(|| 6 * 7, 1024);
            out.store(value, Ordering::SeqCst);
        });
        assert_eq!(result.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn enough_stack_escapes_when_headroom_is_low() {
        let runtime = Runtime::new(1);
        let result = Arc::new(AtomicU64::new(0));
        let out = Arc::clone(&result);
        runtime.run(move || {
            // demand more headroom than the whole stack has, forcing the
            // fresh-coroutine path
            let value = call_with_enough_stack(
                || (1..=100u64).sum::<u64>(),
                crate::config::DEFAULT_STACK_SIZE * 2,
            );
            out.store(value, Ordering::SeqCst);
        });
        assert_eq!(result.load(Ordering::SeqCst), 5050);
    }

    #[test]
    fn enough_stack_forwards_panics() {
        let runtime = Runtime::new(1);
        let caught = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&caught);
        runtime.run(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                call_with_enough_stack(
                    || -> u64 { panic!("deliberate") },
                    crate::config::DEFAULT_STACK_SIZE * 2,
                )
            }));
            flag.store(outcome.is_err(), Ordering::SeqCst);
        });
        assert!(caught.load(Ordering::SeqCst));
    }

    #[test]
    fn notify_from_outside_the_runtime() {
        let runtime = Runtime::new(1);
        let handle_slot: Arc<Mutex<Option<crate::coro::CoroHandle>>> =
            Arc::new(Mutex::new(None));
        let parked = Arc::new(AtomicBool::new(false));
        let woken = Arc::new(AtomicBool::new(false));

        let slot = Arc::clone(&handle_slot);
        let parked_flag = Arc::clone(&parked);
        let woken_flag = Arc::clone(&woken);

        let notifier = {
            let slot = Arc::clone(&handle_slot);
            let parked = Arc::clone(&parked);
            std::thread::spawn(move || {
                while !parked.load(Ordering::SeqCst) {
                    std::thread::yield_now();
                }
                let handle = slot.lock().take().expect("handle published");
                handle.notify_sometime();
            })
        };

        runtime.run(move || {
            *slot.lock() = Some(current().expect("inside a coroutine"));
            parked_flag.store(true, Ordering::SeqCst);
            wait();
            woken_flag.store(true, Ordering::SeqCst);
        });

        notifier.join().expect("notifier thread");
        assert!(woken.load(Ordering::SeqCst));
    }
}
