//! Affinity-aware FIFO coroutine scheduler
//!
//! Owns a pool of worker threads and a single FIFO task queue. A task is a
//! coroutine handle or a bare callable, optionally pinned to a kernel
//! thread id; callables are wrapped in fresh coroutines at dequeue time so
//! the queue stays cheap and every user callback runs in a context that may
//! itself suspend.
//!
//! The caller thread may participate as one of the logical workers: it then
//! must drive [`Scheduler::run`] itself, and a no-op root coroutine is
//! created lazily on that thread as a seam for steering the loop through
//! coroutine machinery.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};

use strand_core::{rdebug, rerror};
use strand_core::CoroutineState;

use crate::config::RuntimeConfig;
use crate::coroutine::Coroutine;
use crate::thread::Thread;

/// Boxed task callable
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// One queue element: a coroutine or a callable, with optional thread
/// affinity (kernel tid). A task carrying neither payload is silently
/// dropped on submission.
pub struct Task {
    coroutine: Option<Arc<Coroutine>>,
    callback: Option<TaskFn>,
    affinity: Option<u32>,
}

impl Task {
    pub fn from_fn<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            coroutine: None,
            callback: Some(Box::new(f)),
            affinity: None,
        }
    }

    pub fn from_boxed(f: TaskFn) -> Task {
        Task {
            coroutine: None,
            callback: Some(f),
            affinity: None,
        }
    }

    pub fn from_coroutine(co: Arc<Coroutine>) -> Task {
        Task {
            coroutine: Some(co),
            callback: None,
            affinity: None,
        }
    }

    /// Pin the task to a kernel thread id
    pub fn with_affinity(mut self, tid: u32) -> Task {
        self.affinity = Some(tid);
        self
    }

    fn has_payload(&self) -> bool {
        self.coroutine.is_some() || self.callback.is_some()
    }

    fn runnable_by(&self, tid: u32) -> bool {
        self.affinity.map_or(true, |a| a == tid)
    }
}

thread_local! {
    /// Scheduler bound to this thread (worker, reactor or participating caller)
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };
}

/// Multi-threaded FIFO scheduler for coroutines and callables
pub struct Scheduler {
    name: String,
    thread_count: usize,
    use_caller: bool,
    stack_size: usize,

    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,

    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<u32>>,

    active: AtomicUsize,
    idle: AtomicUsize,
    /// True in the stopped state; false between start and stop
    stopping: AtomicBool,

    /// Kernel tid of the participating caller (0 = none)
    root_thread: AtomicU32,
    root_coroutine: Mutex<Option<Arc<Coroutine>>>,

    /// Extra wake action layered on the condvar notify (the I/O manager
    /// pokes its self-pipe here). Set once, before start.
    wake_hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
    /// Per-thread setup run at the top of every `run()` and reactor loop
    /// (the I/O manager binds its thread-locals here). Set once, before start.
    thread_start_hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl Scheduler {
    /// Create a stopped scheduler. `threads` is coerced to at least 1; when
    /// `use_caller` is set, the constructing thread counts as one of them.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        let config = RuntimeConfig::from_env()
            .workers(threads)
            .use_caller(use_caller)
            .name(name);
        Self::with_config(&config)
    }

    /// Create a stopped scheduler from a full configuration
    pub fn with_config(config: &RuntimeConfig) -> Arc<Scheduler> {
        let thread_count = config.workers.max(1);
        Arc::new(Scheduler {
            name: config.name.clone(),
            thread_count,
            use_caller: config.use_caller,
            stack_size: config.stack_size,
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            root_thread: AtomicU32::new(0),
            root_coroutine: Mutex::new(None),
            wake_hook: OnceLock::new(),
            thread_start_hook: OnceLock::new(),
        })
    }

    // ---------- lifecycle ----------

    /// Spawn the worker threads. Idempotent while running.
    ///
    /// With caller participation one fewer OS thread is created and the
    /// caller's tid is recorded; the caller must then drive [`run`](Self::run)
    /// itself.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock().unwrap();
        {
            // The running transition happens under the queue mutex so it is
            // ordered against concurrent submissions.
            let _queue = self.queue.lock().unwrap();
            if !self.stopping.load(Ordering::SeqCst) {
                return;
            }
            self.stopping.store(false, Ordering::SeqCst);
        }

        let mut create = self.thread_count;
        if self.use_caller {
            self.root_thread.store(Thread::current_id(), Ordering::SeqCst);
            create -= 1;
        }

        let mut ids = self.thread_ids.lock().unwrap();
        for i in 0..create {
            let sched = self.clone();
            match Thread::spawn(&format!("{}-worker-{}", self.name, i), move || sched.run()) {
                Ok(t) => {
                    ids.push(t.id());
                    threads.push(t);
                }
                Err(e) => rerror!("{}: failed to spawn worker {}: {}", self.name, i, e),
            }
        }
        rdebug!("{}: started {} worker threads", self.name, threads.len());
    }

    /// Request stop, wake every waiter and join the worker threads.
    ///
    /// Cooperative: in-flight coroutines run to completion. Safe to call
    /// from a worker (it skips joining itself). Never fails.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.cond.notify_all();
        if let Some(hook) = self.wake_hook.get() {
            hook();
        }

        let me = Thread::current_id();
        let mut threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for t in threads.iter_mut() {
            if t.id() == me {
                // Called from a worker; that thread unwinds on its own
                continue;
            }
            t.join();
        }
        self.thread_ids.lock().unwrap().clear();
        rdebug!("{}: stopped", self.name);
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    // ---------- submission ----------

    /// Submit a callable to run on any worker
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_task(Task::from_fn(f));
    }

    /// Submit a callable pinned to a kernel thread id
    pub fn submit_to<F>(&self, f: F, tid: u32)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_task(Task::from_fn(f).with_affinity(tid));
    }

    /// Submit a coroutine to run on any worker
    pub fn submit_coroutine(&self, co: Arc<Coroutine>) {
        self.submit_task(Task::from_coroutine(co));
    }

    /// Submit a coroutine pinned to a kernel thread id
    pub fn submit_coroutine_to(&self, co: Arc<Coroutine>, tid: u32) {
        self.submit_task(Task::from_coroutine(co).with_affinity(tid));
    }

    /// Submit one task; wakes a worker if the queue was empty
    pub fn submit_task(&self, task: Task) {
        if !task.has_payload() {
            return;
        }
        let need_tickle;
        {
            let mut queue = self.queue.lock().unwrap();
            need_tickle = queue.is_empty();
            queue.push_back(task);
        }
        if need_tickle {
            self.tickle();
        }
    }

    /// Submit a batch under one critical section; tickles once if any push
    /// transitioned the queue from empty
    pub fn submit_batch(&self, tasks: Vec<Task>) {
        let mut need_tickle = false;
        {
            let mut queue = self.queue.lock().unwrap();
            for task in tasks {
                if !task.has_payload() {
                    continue;
                }
                need_tickle = need_tickle || queue.is_empty();
                queue.push_back(task);
            }
        }
        if need_tickle {
            self.tickle();
        }
    }

    /// Wake one idle worker, plus whatever the wake hook adds
    fn tickle(&self) {
        self.cond.notify_one();
        if let Some(hook) = self.wake_hook.get() {
            hook();
        }
    }

    // ---------- dispatch ----------

    /// Take the first queued task runnable by this thread (FIFO order,
    /// affinity mismatches skipped)
    fn take_task(&self) -> Option<Task> {
        let mut queue = self.queue.lock().unwrap();
        let tid = Thread::current_id();
        let idx = queue.iter().position(|t| t.runnable_by(tid))?;
        queue.remove(idx)
    }

    /// The dispatch loop. Worker threads enter here; a participating caller
    /// must call it exactly once after `start`.
    pub fn run(self: &Arc<Self>) {
        self.bind_current();

        if self.use_caller && Thread::current_id() == self.root_thread.load(Ordering::SeqCst) {
            self.enter_root_coroutine();
        }

        while !self.stopping.load(Ordering::SeqCst) {
            if let Some(task) = self.take_task() {
                self.active.fetch_add(1, Ordering::SeqCst);
                self.dispatch(task);
                self.active.fetch_sub(1, Ordering::SeqCst);
                continue;
            }

            let mut queue = self.queue.lock().unwrap();
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            self.idle.fetch_add(1, Ordering::SeqCst);
            while !self.stopping.load(Ordering::SeqCst) && queue.is_empty() {
                queue = self.cond.wait(queue).unwrap();
            }
            self.idle.fetch_sub(1, Ordering::SeqCst);
        }

        self.unbind_current();
    }

    fn dispatch(self: &Arc<Self>, task: Task) {
        let affinity = task.affinity;
        let co = match (task.coroutine, task.callback) {
            (Some(co), _) => co,
            (None, Some(cb)) => {
                // Wrap the callable in a fresh coroutine at dequeue time
                match Coroutine::with_stack_size(cb, self.stack_size) {
                    Ok(co) => co,
                    Err(e) => {
                        rerror!("{}: dropping task, {}", self.name, e);
                        return;
                    }
                }
            }
            (None, None) => return,
        };

        if co.state() == CoroutineState::Term {
            return;
        }
        if !co.is_parked() {
            // Still saving its context on another worker; requeue until the
            // switch-out completes
            self.submit_task(resubmission(co, affinity));
            std::thread::yield_now();
            return;
        }

        co.mark_running();
        co.swap_in();
        // Only now is the coroutine's context save complete; re-entry is
        // safe from here on
        co.mark_parked();

        match co.state() {
            CoroutineState::Ready => {
                // Yield-ready: back to the tail of the queue
                self.submit_task(resubmission(co, affinity));
            }
            CoroutineState::Hold => {
                // A reactor wake that raced the switch-out is latched in the
                // wake flag; claiming it here is what makes the resume
                // exactly-once
                if co.claim_wake() {
                    self.submit_task(resubmission(co, affinity));
                }
            }
            _ => {}
        }
    }

    fn enter_root_coroutine(&self) {
        let root = {
            let mut slot = self.root_coroutine.lock().unwrap();
            if slot.is_none() {
                match Coroutine::with_stack_size(|| {}, self.stack_size) {
                    Ok(co) => *slot = Some(co),
                    Err(e) => {
                        rerror!("{}: root coroutine allocation failed: {}", self.name, e);
                        return;
                    }
                }
            }
            slot.as_ref().unwrap().clone()
        };
        root.swap_in();
    }

    // ---------- thread binding ----------

    /// Bind this scheduler to the calling thread and run the per-thread
    /// setup hook. `run` does this itself; the reactor thread of an I/O
    /// manager calls it directly.
    pub fn bind_current(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(weak));
        if let Some(hook) = self.thread_start_hook.get() {
            hook();
        }
    }

    fn unbind_current(self: &Arc<Self>) {
        CURRENT_SCHEDULER.with(|s| {
            let mut slot = s.borrow_mut();
            let bound_to_self = slot
                .as_ref()
                .and_then(|w| w.upgrade())
                .map_or(false, |sched| Arc::ptr_eq(&sched, self));
            if bound_to_self {
                *slot = None;
            }
        });
    }

    /// The scheduler bound to the calling thread, if any
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|s| s.borrow().as_ref().and_then(|w| w.upgrade()))
    }

    /// Root coroutine of the scheduler bound to the calling thread
    pub fn main_coroutine() -> Option<Arc<Coroutine>> {
        Self::current().and_then(|s| s.root_coroutine.lock().unwrap().clone())
    }

    // ---------- hooks (set once, before start) ----------

    /// Layer an extra wake action on top of the condvar notify
    pub fn set_wake_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        let _ = self.wake_hook.set(hook);
    }

    /// Install per-thread setup run by every worker (and reactor) on entry
    pub fn set_thread_start_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        let _ = self.thread_start_hook.set(hook);
    }

    // ---------- observability ----------

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Workers currently executing a task
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Workers blocked on the condition variable
    #[inline]
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    /// Queue length (takes the queue lock briefly)
    pub fn task_count(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Live OS worker threads (excludes a participating caller)
    pub fn worker_count(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    /// Kernel tids of the spawned workers
    pub fn worker_ids(&self) -> Vec<u32> {
        self.thread_ids.lock().unwrap().clone()
    }

    /// Logical worker count this scheduler was built for
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.stopping.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("use_caller", &self.use_caller)
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

fn resubmission(co: Arc<Coroutine>, affinity: Option<u32>) -> Task {
    let task = Task::from_coroutine(co);
    match affinity {
        Some(tid) => task.with_affinity(tid),
        None => task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

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

    #[test]
    fn test_thread_count_coerced() {
        let sched = Scheduler::new(0, false, "coerce");
        assert_eq!(sched.thread_count(), 1);
        assert!(sched.is_stopping());
    }

    #[test]
    fn test_submit_callable_runs() {
        let sched = Scheduler::new(2, false, "basic");
        let hits = Arc::new(AtomicUsize::new(0));

        // Submitted before start: queued, runs once workers exist
        let h = hits.clone();
        sched.submit(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(sched.task_count(), 1);

        sched.start();
        let h = hits.clone();
        sched.submit(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(
            || hits.load(Ordering::SeqCst) == 2,
            Duration::from_secs(5)
        ));
        sched.stop();
        assert_eq!(sched.worker_count(), 0);
    }

    #[test]
    fn test_submit_coroutine_runs() {
        let sched = Scheduler::new(1, false, "coro");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let co = Coroutine::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        sched.submit_coroutine(co.clone());

        assert!(wait_until(
            || co.state() == CoroutineState::Term,
            Duration::from_secs(5)
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        sched.stop();
    }

    #[test]
    fn test_batch_submit() {
        let sched = Scheduler::new(2, false, "batch");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task> = (0..10)
            .map(|_| {
                let h = hits.clone();
                Task::from_fn(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        sched.submit_batch(tasks);

        assert!(wait_until(
            || hits.load(Ordering::SeqCst) == 10,
            Duration::from_secs(5)
        ));
        sched.stop();
    }

    #[test]
    fn test_empty_task_dropped() {
        let sched = Scheduler::new(1, false, "empty");
        sched.submit_task(Task {
            coroutine: None,
            callback: None,
            affinity: None,
        });
        assert_eq!(sched.task_count(), 0);
    }

    #[test]
    fn test_start_idempotent() {
        let sched = Scheduler::new(2, false, "idem");
        sched.start();
        let before = sched.worker_count();
        sched.start();
        assert_eq!(sched.worker_count(), before);
        sched.stop();
    }

    #[test]
    fn test_stop_without_start() {
        let sched = Scheduler::new(2, false, "never-started");
        sched.stop();
        assert!(sched.is_stopping());
    }

    #[test]
    fn test_ready_coroutine_resubmitted() {
        let sched = Scheduler::new(1, false, "ready");
        sched.start();

        let rounds = Arc::new(AtomicUsize::new(0));
        let r = rounds.clone();
        let co = Coroutine::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
            Coroutine::yield_to_ready();
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        sched.submit_coroutine(co.clone());

        // Both halves run without any manual resubmission
        assert!(wait_until(
            || co.state() == CoroutineState::Term,
            Duration::from_secs(5)
        ));
        assert_eq!(rounds.load(Ordering::SeqCst), 2);
        sched.stop();
    }
}
