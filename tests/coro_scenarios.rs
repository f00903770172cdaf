//! Coroutine runtime scenarios: large wakeup fan-outs, cooperative
//! interleavings, migration, and stack escape under deep recursion.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use burrowdb::coro::{
    call_with_enough_stack, current, spawn_later_ordered, spawn_now, spawn_sometime, wait,
    yield_now, yield_ordered,
};
use burrowdb::Runtime;

#[test]
fn thousand_waiters_wake_in_any_order() {
    const N: u64 = 1000;
    let runtime = Runtime::new(1);
    let woken = Arc::new(AtomicU64::new(0));
    let observed = Arc::clone(&woken);

    runtime.run(move || {
        let mut handles = Vec::with_capacity(N as usize);
        for _ in 0..N {
            let woken = Arc::clone(&observed);
            handles.push(spawn_sometime(move || {
                wait();
                woken.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // let every waiter reach its wait() before any notify goes out
        yield_now();
        assert_eq!(observed.load(Ordering::SeqCst), 0);

        // notify in a scrambled (but full) permutation of spawn order
        for i in 0..N {
            let scrambled = (i * 7919) % N;
            handles[scrambled as usize].notify_sometime();
        }
    });

    assert_eq!(woken.load(Ordering::SeqCst), N);
}

#[test]
fn ordered_yielders_alternate_strictly() {
    let runtime = Runtime::new(1);
    let log: Arc<Mutex<Vec<(char, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    let outer = Arc::clone(&log);

    runtime.run(move || {
        for name in ['a', 'b'] {
            let log = Arc::clone(&outer);
            spawn_later_ordered(move || {
                for round in 0..100u32 {
                    log.lock().push((name, round));
                    yield_ordered();
                }
            });
        }
    });

    let log = log.lock();
    assert_eq!(log.len(), 200);
    for (i, (name, round)) in log.iter().enumerate() {
        let expected_name = if i % 2 == 0 { 'a' } else { 'b' };
        assert_eq!(*name, expected_name, "turn {i}");
        assert_eq!(*round as usize, i / 2, "turn {i}");
    }
}

#[test]
fn notify_before_wait_is_not_lost() {
    let runtime = Runtime::new(1);
    let finished = Arc::new(AtomicU64::new(0));
    let observed = Arc::clone(&finished);

    runtime.run(move || {
        for _ in 0..50 {
            let finished = Arc::clone(&observed);
            let handle = spawn_sometime(move || {
                // by the time this runs the notify below already happened
                wait();
                finished.fetch_add(1, Ordering::SeqCst);
            });
            handle.notify_sometime();
        }
    });

    assert_eq!(finished.load(Ordering::SeqCst), 50);
}

#[test]
fn each_wait_consumes_exactly_one_notify() {
    let runtime = Runtime::new(1);
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let outer = Arc::clone(&log);

    runtime.run(move || {
        let waiter_log = Arc::clone(&outer);
        let waiter = spawn_sometime(move || {
            wait();
            waiter_log.lock().push("first wake");
            wait();
            waiter_log.lock().push("second wake");
        });
        yield_now(); // the waiter parks on its first wait()
        waiter.notify_sometime();
        yield_now(); // the waiter wakes once and parks on its second wait()
        outer.lock().push("between notifies");
        waiter.notify_sometime();
    });

    // a single notify must never satisfy both waits
    assert_eq!(
        *log.lock(),
        vec!["first wake", "between notifies", "second wake"]
    );
}

// Under the threaded fallback coroutines run on their own OS threads, so
// the thread name no longer reveals the scheduling worker; these two
// tests only apply to the stack-switching implementation.
#[cfg(all(
    not(feature = "threaded-coroutines"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
fn worker_name() -> String {
    std::thread::current()
        .name()
        .expect("worker threads are named")
        .to_string()
}

#[cfg(all(
    not(feature = "threaded-coroutines"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
#[test]
fn migration_hops_across_every_worker() {
    use burrowdb::coro::move_to_thread;

    let runtime = Runtime::new(4);
    let visited = Arc::new(Mutex::new(Vec::new()));
    let outer = Arc::clone(&visited);

    runtime.run(move || {
        for target in [1usize, 2, 3, 0] {
            move_to_thread(target);
            outer.lock().push(worker_name());
        }
    });

    assert_eq!(
        *visited.lock(),
        vec![
            "burrow-worker-1".to_string(),
            "burrow-worker-2".to_string(),
            "burrow-worker-3".to_string(),
            "burrow-worker-0".to_string(),
        ]
    );
}

#[cfg(all(
    not(feature = "threaded-coroutines"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
#[test]
fn on_thread_guard_restores_the_home_worker() {
    use burrowdb::coro::OnThread;

    let runtime = Runtime::new(2);
    let names = Arc::new(Mutex::new(Vec::new()));
    let outer = Arc::clone(&names);

    runtime.run(move || {
        outer.lock().push(worker_name());
        {
            let _guard = OnThread::new(1);
            outer.lock().push(worker_name());
        }
        outer.lock().push(worker_name());
    });

    assert_eq!(
        *names.lock(),
        vec![
            "burrow-worker-0".to_string(),
            "burrow-worker-1".to_string(),
            "burrow-worker-0".to_string(),
        ]
    );
}

/// Burns ~2 KiB of stack per level, escaping to a fresh coroutine whenever
/// headroom runs low. 200 levels would otherwise blow through the default
/// stack several times over.
fn descend(levels: u32) -> u64 {
    let padding = [0u8; 2048];
    std::hint::black_box(&padding);
    if levels == 0 {
        return 0;
    }
    call_with_enough_stack(|| descend(levels - 1) + 1, 16 * 1024)
}

#[test]
fn deep_recursion_escapes_to_fresh_stacks() {
    let runtime = Runtime::new(1);
    let result = Arc::new(AtomicU64::new(0));
    let out = Arc::clone(&result);

    runtime.run(move || {
        out.store(descend(200), Ordering::SeqCst);
    });

    assert_eq!(result.load(Ordering::SeqCst), 200);
}

#[test]
fn spawn_now_nests() {
    let runtime = Runtime::new(1);
    let log = Arc::new(Mutex::new(Vec::new()));
    let outer = Arc::clone(&log);

    runtime.run(move || {
        let log = Arc::clone(&outer);
        spawn_now(move || {
            let inner = Arc::clone(&log);
            log.lock().push("child enter");
            spawn_now(move || {
                inner.lock().push("grandchild");
            });
            log.lock().push("child exit");
        });
        outer.lock().push("parent");
    });

    // each spawn_now hands the queue head to the child; the spawner
    // rejoins at the tail, behind anything already queued
    assert_eq!(
        *log.lock(),
        vec!["child enter", "grandchild", "parent", "child exit"]
    );
}

#[test]
fn producer_consumer_handoff() {
    let runtime = Runtime::new(1);
    let received = Arc::new(Mutex::new(Vec::new()));
    let outer = Arc::clone(&received);

    runtime.run(move || {
        let queue: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        let consumer_queue = Arc::clone(&queue);
        let consumer_done = Arc::clone(&done);
        let sink = Arc::clone(&outer);
        let consumer = spawn_sometime(move || loop {
            let drained: Vec<u32> = consumer_queue.lock().drain(..).collect();
            sink.lock().extend(drained);
            if consumer_done.load(Ordering::SeqCst) == 1 && consumer_queue.lock().is_empty() {
                break;
            }
            wait();
        });

        for item in 0..20u32 {
            queue.lock().push(item);
            consumer.notify_sometime();
            yield_now();
        }
        done.store(1, Ordering::SeqCst);
        consumer.notify_sometime();
    });

    assert_eq!(*received.lock(), (0..20).collect::<Vec<u32>>());
}

#[test]
fn current_identifies_the_running_coroutine() {
    let runtime = Runtime::new(1);
    let ids = Arc::new(Mutex::new(Vec::new()));
    let outer = Arc::clone(&ids);

    runtime.run(move || {
        let me = current().expect("inside a coroutine").id();
        let ids = Arc::clone(&outer);
        spawn_now(move || {
            ids.lock()
                .push(current().expect("inside a coroutine").id());
        });
        outer.lock().push(me);
    });

    let ids = ids.lock();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1], "parent and child must have distinct ids");
}

#[test]
fn runtimes_shut_down_cleanly_when_idle() {
    for _ in 0..3 {
        let runtime = Runtime::new(2);
        runtime.run(|| {});
        drop(runtime);
    }
}
