//! I/O manager: the scheduler specialized with an epoll reactor
//!
//! [`IoManager`] wraps a [`Scheduler`] and drives a level-triggered kernel
//! multiplexer in edge-triggered, single-shot-per-arming mode: each armed
//! (fd, event) pair carries exactly one continuation (a callable or a
//! suspended coroutine), and readiness moves that continuation onto the
//! scheduler queue exactly once. The cancel path performs the same
//! single-shot transition, so per (fd, event) the reactor is always in one
//! of two states: armed with a continuation, or not armed.
//!
//! The reactor loop runs on a dedicated `{name}-reactor` thread; worker
//! threads stay in the scheduler's dispatch loop. An eventfd self-pipe
//! (registered with a null tag) breaks the reactor out of its infinite
//! wait whenever a task is submitted or stop is requested.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use strand_core::{rdebug, rerror, rwarn};
use strand_core::{EventMask, IoEvent, RtResult, RuntimeError};
use strand_runtime::scheduler::Task;
use strand_runtime::{Coroutine, RuntimeConfig, Scheduler, Thread};

/// Continuation attached to an armed (fd, event) pair
enum Continuation {
    Callback(Box<dyn FnOnce() + Send + 'static>),
    Coroutine(Arc<Coroutine>),
}

/// Per-fd registration record. The raw pointer to this struct is the epoll
/// user tag, so entries are never moved or freed while the manager lives.
struct FdContext {
    fd: i32,
    inner: Mutex<FdContextInner>,
}

struct FdContextInner {
    /// Events currently armed in the multiplexer for this fd
    events: EventMask,
    read: Option<Continuation>,
    write: Option<Continuation>,
}

impl FdContextInner {
    fn slot_mut(&mut self, ev: IoEvent) -> &mut Option<Continuation> {
        match ev {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }
}

thread_local! {
    static CURRENT_IO: std::cell::RefCell<Option<Weak<IoManager>>> =
        const { std::cell::RefCell::new(None) };
}

/// Scheduler + epoll reactor
///
/// Derefs to [`Scheduler`], so submission and observability methods are
/// available directly on the manager.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    epfd: i32,
    wake_fd: i32,
    /// fd-indexed table, grown by doubling; entries allocated lazily
    contexts: Mutex<Vec<Option<Arc<FdContext>>>>,
    /// Count of armed (fd, event) pairs
    pending: AtomicUsize,
    reactor: Mutex<Option<Thread>>,
    max_events: usize,
}

impl IoManager {
    /// Create a stopped I/O manager with `threads` logical workers
    pub fn new(threads: usize, use_caller: bool, name: &str) -> RtResult<Arc<IoManager>> {
        let config = RuntimeConfig::from_env()
            .workers(threads)
            .use_caller(use_caller)
            .name(name);
        Self::with_config(config)
    }

    /// Create a stopped I/O manager from a full configuration
    pub fn with_config(config: RuntimeConfig) -> RtResult<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RuntimeError::ReactorSetup(last_errno()));
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let e = last_errno();
            unsafe { libc::close(epfd) };
            return Err(RuntimeError::ReactorSetup(e));
        }

        // Self-pipe registration; the null tag distinguishes it from fd
        // contexts in the reactor loop
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 0,
        };
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if rc != 0 {
            let e = last_errno();
            unsafe {
                libc::close(epfd);
                libc::close(wake_fd);
            }
            return Err(RuntimeError::ReactorSetup(e));
        }

        let scheduler = Scheduler::with_config(&config);

        // Wake hook: poke the self-pipe on top of the condvar notify, so a
        // submission interrupts the reactor's infinite wait too.
        let pipe_fd = wake_fd;
        scheduler.set_wake_hook(Box::new(move || {
            let one: u64 = 1;
            let rc = unsafe { libc::write(pipe_fd, &one as *const u64 as *const libc::c_void, 8) };
            if rc < 0 {
                let e = last_errno();
                if e != libc::EAGAIN {
                    rwarn!("io wake write failed: errno {}", e);
                }
            }
        }));

        let io = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let w = weak.clone();
            scheduler.set_thread_start_hook(Box::new(move || {
                CURRENT_IO.with(|c| *c.borrow_mut() = Some(w.clone()));
            }));

            IoManager {
                scheduler,
                epfd,
                wake_fd,
                contexts: Mutex::new(vec![None; config.fd_slots.max(1)]),
                pending: AtomicUsize::new(0),
                reactor: Mutex::new(None),
                max_events: config.max_events.max(1),
            }
        });
        Ok(io)
    }

    /// The I/O manager bound to the calling thread (workers, the reactor
    /// and a participating caller)
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IO.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()))
    }

    // ---------- lifecycle ----------

    /// Start the scheduler workers and the reactor thread
    pub fn start(self: &Arc<Self>) {
        self.scheduler.start();

        let mut slot = self.reactor.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let io = self.clone();
        let name = format!("{}-reactor", self.scheduler.name());
        match Thread::spawn(&name, move || io.reactor_loop()) {
            Ok(t) => *slot = Some(t),
            Err(e) => rerror!("{}: failed to spawn reactor: {}", self.scheduler.name(), e),
        }
    }

    /// Stop the scheduler (waking and joining its workers), then wake and
    /// join the reactor
    pub fn stop(&self) {
        self.scheduler.stop();
        if let Some(mut t) = self.reactor.lock().unwrap().take() {
            t.join();
        }
    }

    /// Dispatch loop entry for a participating caller thread
    pub fn run(self: &Arc<Self>) {
        self.scheduler.run();
    }

    /// Count of armed (fd, event) pairs
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    // ---------- event registration ----------

    /// Arm `ev` on `fd` with a callback continuation.
    ///
    /// Fails with [`RuntimeError::EventExists`] if the event is already
    /// armed, and with [`RuntimeError::Os`] if the multiplexer update
    /// fails; in both cases the fd state is exactly what it was before the
    /// call.
    pub fn add_event<F>(&self, fd: i32, ev: IoEvent, cb: F) -> RtResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.arm_event(fd, ev, Continuation::Callback(Box::new(cb)))
    }

    /// Arm `ev` on `fd` with a coroutine to resume
    pub fn add_event_coroutine(&self, fd: i32, ev: IoEvent, co: Arc<Coroutine>) -> RtResult<()> {
        self.arm_event(fd, ev, Continuation::Coroutine(co))
    }

    fn arm_event(&self, fd: i32, ev: IoEvent, cont: Continuation) -> RtResult<()> {
        let ctx = self.ensure_context(fd)?;
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.contains(ev) {
            return Err(RuntimeError::EventExists);
        }

        let new_mask = inner.events.with(ev);
        self.update_multiplexer(&ctx, inner.events, new_mask)
            .map_err(RuntimeError::Os)?;

        *inner.slot_mut(ev) = Some(cont);
        inner.events = new_mask;
        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Disarm `ev` on `fd` without running its continuation.
    /// Returns false if the event was not armed.
    pub fn del_event(&self, fd: i32, ev: IoEvent) -> bool {
        let Some(ctx) = self.get_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(ev) {
            return false;
        }

        let new_mask = inner.events.without(ev);
        if let Err(e) = self.update_multiplexer(&ctx, inner.events, new_mask) {
            rwarn!("del_event fd {} {}: epoll update failed, errno {}", fd, ev, e);
        }
        inner.slot_mut(ev).take();
        inner.events = new_mask;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarm `ev` on `fd` and submit its continuation to the scheduler.
    /// Returns false if the event was not armed; on true the continuation
    /// runs exactly once on a scheduler worker.
    pub fn cancel_event(&self, fd: i32, ev: IoEvent) -> bool {
        let Some(ctx) = self.get_context(fd) else {
            return false;
        };
        let cont;
        {
            let mut inner = ctx.inner.lock().unwrap();
            if !inner.events.contains(ev) {
                return false;
            }
            cont = inner.slot_mut(ev).take();
            let new_mask = inner.events.without(ev);
            if let Err(e) = self.update_multiplexer(&ctx, inner.events, new_mask) {
                rwarn!(
                    "cancel_event fd {} {}: epoll update failed, errno {}",
                    fd,
                    ev,
                    e
                );
            }
            inner.events = new_mask;
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        // Outside the fd lock
        if let Some(cont) = cont {
            self.submit_continuation(cont);
        }
        true
    }

    /// Disarm everything on `fd` and submit any captured continuations.
    /// Returns false if nothing was armed.
    pub fn cancel_all(&self, fd: i32) -> bool {
        let Some(ctx) = self.get_context(fd) else {
            return false;
        };
        let read;
        let write;
        {
            let mut inner = ctx.inner.lock().unwrap();
            if inner.events.is_empty() {
                return false;
            }
            let armed = inner.events.len();
            read = inner.read.take();
            write = inner.write.take();
            if let Err(e) = self.update_multiplexer(&ctx, inner.events, EventMask::NONE) {
                rwarn!("cancel_all fd {}: epoll removal failed, errno {}", fd, e);
            }
            inner.events = EventMask::NONE;
            self.pending.fetch_sub(armed, Ordering::SeqCst);
        }
        if let Some(cont) = read {
            self.submit_continuation(cont);
        }
        if let Some(cont) = write {
            self.submit_continuation(cont);
        }
        true
    }

    // ---------- internals ----------

    fn ensure_context(&self, fd: i32) -> RtResult<Arc<FdContext>> {
        if fd < 0 {
            return Err(RuntimeError::InvalidFd(fd));
        }
        let idx = fd as usize;
        let mut table = self.contexts.lock().unwrap();
        if idx >= table.len() {
            let mut newsz = table.len().max(1);
            while idx >= newsz {
                newsz *= 2;
            }
            table.resize(newsz, None);
        }
        if table[idx].is_none() {
            table[idx] = Some(Arc::new(FdContext {
                fd,
                inner: Mutex::new(FdContextInner {
                    events: EventMask::NONE,
                    read: None,
                    write: None,
                }),
            }));
        }
        Ok(table[idx].clone().unwrap())
    }

    fn get_context(&self, fd: i32) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let table = self.contexts.lock().unwrap();
        table.get(fd as usize).cloned().flatten()
    }

    /// Apply a mask transition to the multiplexer. Chooses ADD/MOD/DEL from
    /// the old and new masks and recovers the ADD/MOD races: a concurrent
    /// registration turns ADD into EEXIST (retry as MOD) and a concurrent
    /// removal turns MOD into ENOENT (retry as ADD). DEL of an
    /// already-removed fd is not an error.
    fn update_multiplexer(
        &self,
        ctx: &Arc<FdContext>,
        old: EventMask,
        new: EventMask,
    ) -> Result<(), i32> {
        let op = if old.is_empty() {
            libc::EPOLL_CTL_ADD
        } else if new.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        match self.epoll_ctl(op, ctx, new) {
            Ok(()) => Ok(()),
            Err(e) if op == libc::EPOLL_CTL_ADD && e == libc::EEXIST => {
                self.epoll_ctl(libc::EPOLL_CTL_MOD, ctx, new)
            }
            Err(e) if op == libc::EPOLL_CTL_MOD && e == libc::ENOENT => {
                self.epoll_ctl(libc::EPOLL_CTL_ADD, ctx, new)
            }
            Err(e) if op == libc::EPOLL_CTL_DEL && e == libc::ENOENT => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn epoll_ctl(&self, op: i32, ctx: &Arc<FdContext>, mask: EventMask) -> Result<(), i32> {
        let mut ev = libc::epoll_event {
            events: epoll_bits(mask),
            u64: Arc::as_ptr(ctx) as usize as u64,
        };
        let evp = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut ev as *mut libc::epoll_event
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, ctx.fd, evp) };
        if rc == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    /// Move the armed continuation out for `ev`, update the multiplexer to
    /// the remaining mask, and submit the continuation to the scheduler.
    /// Multiplexer errors on this path are logged and swallowed: the
    /// transition must not leak tasks.
    fn trigger_event(&self, ctx: &FdContext, ev: IoEvent) {
        let cont;
        {
            let mut inner = ctx.inner.lock().unwrap();
            if !inner.events.contains(ev) {
                // Cancelled between readiness and trigger
                return;
            }
            cont = inner.slot_mut(ev).take();
            let new_mask = inner.events.without(ev);
            if let Err(e) = self.raw_update(ctx, inner.events, new_mask) {
                rwarn!(
                    "trigger fd {} {}: epoll update failed, errno {}",
                    ctx.fd,
                    ev,
                    e
                );
            }
            inner.events = new_mask;
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(cont) = cont {
            self.submit_continuation(cont);
        }
    }

    /// `update_multiplexer` for call sites that only have `&FdContext`
    /// (the tag pointer is recomputed from the reference; it is the same
    /// address the registration used)
    fn raw_update(&self, ctx: &FdContext, old: EventMask, new: EventMask) -> Result<(), i32> {
        let op = if new.is_empty() {
            libc::EPOLL_CTL_DEL
        } else if old.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: epoll_bits(new),
            u64: ctx as *const FdContext as usize as u64,
        };
        let evp = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut ev as *mut libc::epoll_event
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, ctx.fd, evp) };
        if rc == 0 || (op == libc::EPOLL_CTL_DEL && last_errno() == libc::ENOENT) {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    fn submit_continuation(&self, cont: Continuation) {
        match cont {
            Continuation::Callback(cb) => self.scheduler.submit_task(Task::from_boxed(cb)),
            Continuation::Coroutine(co) => {
                // The coroutine may still be mid-switch-out on a worker;
                // latch the wake and only enqueue once it is parked. The
                // dispatcher claims the latch otherwise.
                co.request_wake();
                if co.is_parked() && co.claim_wake() {
                    self.scheduler.submit_task(Task::from_coroutine(co));
                }
            }
        }
    }

    // ---------- reactor ----------

    fn reactor_loop(self: &Arc<Self>) {
        self.scheduler.bind_current();
        rdebug!("{}: reactor running", self.scheduler.name());

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];

        while !self.scheduler.is_stopping() {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, -1)
            };
            if n < 0 {
                let e = last_errno();
                if e == libc::EINTR {
                    continue;
                }
                rerror!("{}: epoll_wait failed, errno {}", self.scheduler.name(), e);
                continue;
            }

            for event in events.iter().take(n as usize) {
                let tag = event.u64;
                let revents = event.events;

                if tag == 0 {
                    // Self-pipe wakeup: drain the eventfd counter
                    let mut value: u64 = 0;
                    unsafe {
                        libc::read(
                            self.wake_fd,
                            &mut value as *mut u64 as *mut libc::c_void,
                            8,
                        )
                    };
                    continue;
                }

                let ctx = unsafe { &*(tag as usize as *const FdContext) };
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // Error or hangup fans out to both directions
                    self.trigger_event(ctx, IoEvent::Read);
                    self.trigger_event(ctx, IoEvent::Write);
                    continue;
                }
                if revents & libc::EPOLLIN as u32 != 0 {
                    self.trigger_event(ctx, IoEvent::Read);
                }
                if revents & libc::EPOLLOUT as u32 != 0 {
                    self.trigger_event(ctx, IoEvent::Write);
                }
            }
        }
        rdebug!("{}: reactor exited", self.scheduler.name());
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_fd);
        }
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("name", &self.scheduler.name())
            .field("pending_events", &self.pending_event_count())
            .field("stopping", &self.scheduler.is_stopping())
            .finish()
    }
}

fn epoll_bits(mask: EventMask) -> u32 {
    let mut bits = (libc::EPOLLET | libc::EPOLLERR | libc::EPOLLHUP) as u32;
    if mask.contains(IoEvent::Read) {
        bits |= libc::EPOLLIN as u32;
    }
    if mask.contains(IoEvent::Write) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
