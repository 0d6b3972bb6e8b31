//! Multi-thread scheduler scenarios

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strand_runtime::{Coroutine, CoroutineState, Scheduler, Thread};

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// A yields READY twice; with a single worker and FIFO order, B and C make
/// progress between A's yields and A completes last.
#[test]
fn yield_ordering_is_fifo() {
    let sched = Scheduler::new(1, false, "fifo");
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let a = {
        let log = log.clone();
        Coroutine::new(move || {
            log.lock().unwrap().push("a1");
            Coroutine::yield_to_ready();
            log.lock().unwrap().push("a2");
            Coroutine::yield_to_ready();
            log.lock().unwrap().push("a3");
        })
        .unwrap()
    };
    let b = {
        let log = log.clone();
        Coroutine::new(move || {
            log.lock().unwrap().push("b");
        })
        .unwrap()
    };
    let c = {
        let log = log.clone();
        Coroutine::new(move || {
            log.lock().unwrap().push("c");
        })
        .unwrap()
    };

    sched.submit_coroutine(a.clone());
    sched.submit_coroutine(b);
    sched.submit_coroutine(c);
    sched.start();

    assert!(wait_until(
        || a.state() == CoroutineState::Term,
        Duration::from_secs(5)
    ));
    sched.stop();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 5);
    assert_eq!(log[0], "a1");
    // At least one of b/c ran between a's yields
    let a2_pos = log.iter().position(|s| *s == "a2").unwrap();
    assert!(log[1..a2_pos].iter().any(|s| *s == "b" || *s == "c"));
    // A completes last
    assert_eq!(*log.last().unwrap(), "a3");
}

/// Stop returns only after every worker exited, and at least the submitted
/// coroutines were created.
#[test]
fn stop_joins_all_workers() {
    let initial = Coroutine::total();
    let sched = Scheduler::new(4, false, "stopper");
    sched.start();
    assert_eq!(sched.worker_count(), 4);

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let done = done.clone();
        let co = Coroutine::new(move || {
            Coroutine::yield_to_ready();
            Coroutine::yield_to_ready();
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        sched.submit_coroutine(co);
    }

    assert!(wait_until(
        || done.load(Ordering::SeqCst) == 100,
        Duration::from_secs(10)
    ));
    sched.stop();

    assert_eq!(sched.worker_count(), 0);
    assert!(Coroutine::total() - initial >= 100);
    // Submitting during/after stop is accepted and must not deadlock
    sched.submit(|| {});
}

/// With use_caller the constructing thread is one of the logical workers:
/// an affinity task pinned to the caller's tid runs on the caller thread.
#[test]
fn caller_participates_and_affinity_pins() {
    let sched = Scheduler::new(1, true, "caller");
    sched.start();
    // One logical worker that is the caller itself: no OS threads spawned
    assert_eq!(sched.worker_count(), 0);

    let caller_tid = Thread::current_id();
    let observed = Arc::new(AtomicU32::new(0));
    let saw_root = Arc::new(AtomicUsize::new(0));

    let o = observed.clone();
    let s = saw_root.clone();
    let stopper = sched.clone();
    sched.submit_to(
        move || {
            o.store(Thread::current_id(), Ordering::SeqCst);
            // The root coroutine seam exists on the participating caller
            if Scheduler::main_coroutine().is_some() {
                s.store(1, Ordering::SeqCst);
            }
            stopper.stop();
        },
        caller_tid,
    );

    // The caller drives the loop; it returns once stop() flips the flag
    sched.run();

    assert_eq!(observed.load(Ordering::SeqCst), caller_tid);
    assert_eq!(saw_root.load(Ordering::SeqCst), 1);
}

/// A task pinned to a thread that is not in the pool is skipped by every
/// worker and still sits in the queue at stop time.
#[test]
fn affinity_mismatch_is_skipped() {
    let sched = Scheduler::new(2, false, "mismatch");
    sched.start();

    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    // Tid 1 is the init process; never one of our workers
    sched.submit_to(
        move || {
            r.fetch_add(1, Ordering::SeqCst);
        },
        1,
    );

    let r = ran.clone();
    sched.submit(move || {
        r.fetch_add(10, Ordering::SeqCst);
    });

    assert!(wait_until(
        || ran.load(Ordering::SeqCst) == 10,
        Duration::from_secs(5)
    ));
    assert_eq!(sched.task_count(), 1);
    sched.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 10);
}

/// Panicking tasks are contained; the worker keeps dispatching.
#[test]
fn panic_in_task_does_not_kill_worker() {
    let sched = Scheduler::new(1, false, "panicky");
    sched.start();

    sched.submit(|| panic!("task panic"));
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    sched.submit(move || {
        r.fetch_add(1, Ordering::SeqCst);
    });

    assert!(wait_until(
        || ran.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
    sched.stop();
}

/// Counters: idle while empty, active while running.
#[test]
fn counters_track_workers() {
    let sched = Scheduler::new(2, false, "counted");
    sched.start();

    assert!(wait_until(|| sched.idle_count() == 2, Duration::from_secs(5)));

    let release = Arc::new(AtomicUsize::new(0));
    let r = release.clone();
    sched.submit(move || {
        while r.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    assert!(wait_until(|| sched.active_count() >= 1, Duration::from_secs(5)));
    release.store(1, Ordering::SeqCst);
    assert!(wait_until(|| sched.active_count() == 0, Duration::from_secs(5)));
    sched.stop();
}
