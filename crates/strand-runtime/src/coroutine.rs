//! Stackful coroutines
//!
//! A [`Coroutine`] owns a private stack and a saved register block. Two
//! operations compose symmetric switching: [`Coroutine::swap_in`] enters the
//! coroutine from the calling thread's context and [`Coroutine::swap_out`]
//! returns to the thread's *main coroutine* — a stackless `Coroutine` that
//! stands for the thread's ambient context, created lazily the first time a
//! coroutine runs on that thread.
//!
//! The entry closure runs inside a catch-all: a panic terminates the
//! coroutine, not the worker. When the closure finishes the trampoline
//! switches back to the main context unconditionally; if that switch ever
//! falls through the process aborts, because the thread's ambient context
//! is lost.

use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use strand_core::rerror;
use strand_core::{CoroutineState, RtResult, RuntimeError};

use crate::arch::{self, Context};
use crate::stack::Stack;
use crate::tls;

/// Default private stack size: 128 KiB
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Process-global count of coroutines ever created (main coroutines
/// included); doubles as the id allocator.
static COROUTINE_COUNT: AtomicU64 = AtomicU64::new(0);

type EntryClosure = Box<dyn FnOnce() + Send + 'static>;

/// A stackful coroutine
///
/// Shared as `Arc<Coroutine>`: the scheduler queue, the reactor's fd
/// contexts and user code may all hold handles to the same coroutine.
pub struct Coroutine {
    id: u64,
    /// `None` for a main coroutine
    stack: Option<Stack>,
    state: AtomicU8,
    /// True once the coroutine's context save is complete and it is not
    /// running anywhere. Cleared by the dispatcher right before swap-in.
    parked: AtomicBool,
    /// Latched resume request; claimed exactly once (see `claim_wake`)
    wake_pending: AtomicBool,
    ctx: UnsafeCell<Context>,
    entry: UnsafeCell<Option<EntryClosure>>,
}

// Safety: `ctx` and `entry` are only touched by the thread the coroutine is
// currently executing or switching on, and a coroutine executes on at most
// one thread at any instant. Cross-thread handoff happens through the
// scheduler queue / reactor, both of which provide the necessary
// synchronization; the parked/wake latch keeps a coroutine from being
// entered before its previous switch-out finished saving registers.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    /// Create a coroutine with the default stack size
    pub fn new<F>(cb: F) -> RtResult<Arc<Coroutine>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(cb, DEFAULT_STACK_SIZE)
    }

    /// Create a coroutine with an explicit stack size (0 means default)
    pub fn with_stack_size<F>(cb: F, stack_size: usize) -> RtResult<Arc<Coroutine>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        let stack = Stack::new(stack_size)?;

        let co = Arc::new(Coroutine {
            id: COROUTINE_COUNT.fetch_add(1, Ordering::Relaxed) + 1,
            stack: Some(stack),
            state: AtomicU8::new(CoroutineState::Init as u8),
            parked: AtomicBool::new(true),
            wake_pending: AtomicBool::new(false),
            ctx: UnsafeCell::new(Context::zeroed()),
            entry: UnsafeCell::new(Some(Box::new(cb))),
        });

        // The Arc payload address is stable; hand it to the trampoline.
        unsafe {
            arch::init_context(
                co.ctx.get(),
                co.stack.as_ref().unwrap().top(),
                coroutine_main as usize,
                Arc::as_ptr(&co) as usize,
            );
        }
        Ok(co)
    }

    /// The thread's main coroutine, created on first use
    fn main_for_thread() -> Arc<Coroutine> {
        if let Some(main) = tls::main() {
            return main;
        }
        let main = Arc::new(Coroutine {
            id: COROUTINE_COUNT.fetch_add(1, Ordering::Relaxed) + 1,
            stack: None,
            state: AtomicU8::new(CoroutineState::Exec as u8),
            parked: AtomicBool::new(false),
            wake_pending: AtomicBool::new(false),
            ctx: UnsafeCell::new(Context::zeroed()),
            entry: UnsafeCell::new(None),
        });
        tls::set_main(main.clone());
        if tls::current().is_none() {
            tls::set_current(main.clone());
        }
        main
    }

    // ---------- identity / observation ----------

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> CoroutineState {
        CoroutineState::from(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_state(&self, s: CoroutineState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    /// Whether this is a thread's main coroutine (no private stack)
    #[inline]
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// Usable stack bytes; 0 for a main coroutine
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, |s| s.size())
    }

    /// Total coroutines ever created in this process (mains included)
    pub fn total() -> u64 {
        COROUTINE_COUNT.load(Ordering::Relaxed)
    }

    // ---------- park / wake latch ----------

    #[inline]
    pub(crate) fn mark_running(&self) {
        self.parked.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn mark_parked(&self) {
        self.parked.store(true, Ordering::SeqCst);
    }

    /// Whether the coroutine's last switch-out has completed
    #[inline]
    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst)
    }

    /// Latch a resume request. Pair with [`Coroutine::claim_wake`]:
    /// whichever party (waker or dispatcher) claims after the park wins the
    /// right to resubmit, so the coroutine is enqueued exactly once.
    #[inline]
    pub fn request_wake(&self) {
        self.wake_pending.store(true, Ordering::SeqCst);
    }

    /// Claim a latched resume request; true at most once per request
    #[inline]
    pub fn claim_wake(&self) -> bool {
        self.wake_pending.swap(false, Ordering::SeqCst)
    }

    // ---------- lifecycle ----------

    /// Rebind the entry closure and reinitialize the saved context against
    /// the existing stack. Allowed only in INIT or TERM, and only on a
    /// coroutine with a private stack.
    pub fn reset<F>(&self, cb: F) -> RtResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = self.stack.as_ref().ok_or(RuntimeError::NoStack)?;
        let state = self.state();
        if !state.is_resettable() {
            return Err(RuntimeError::InvalidState(state));
        }
        unsafe {
            *self.entry.get() = Some(Box::new(cb));
            arch::init_context(
                self.ctx.get(),
                stack.top(),
                coroutine_main as usize,
                self as *const Coroutine as usize,
            );
        }
        self.set_state(CoroutineState::Init);
        Ok(())
    }

    /// Switch from the calling context into this coroutine.
    ///
    /// Creates the thread's main coroutine on first use. Returns when some
    /// other party switches back into the caller's context.
    pub fn swap_in(self: &Arc<Self>) {
        Self::main_for_thread();
        let prev = Self::current();
        if Arc::ptr_eq(&prev, self) {
            return;
        }
        self.set_state(CoroutineState::Exec);
        tls::set_current(self.clone());

        let prev_ctx = prev.ctx.get();
        let self_ctx = self.ctx.get();
        // A clone of `prev` must not sit in this frame while it is frozen:
        // if `prev` is itself a coroutine that never resumes, the clone
        // would keep it alive forever.
        drop(prev);
        unsafe {
            arch::context_switch(prev_ctx, self_ctx);
        }
    }

    /// Switch from this coroutine back to the thread's main coroutine.
    ///
    /// A coroutine in EXEC is moved to HOLD; a state the caller pre-set
    /// (such as READY) is left alone.
    pub fn swap_out(&self) {
        let main = tls::main().expect("swap_out: no main coroutine on this thread");
        if self.state() == CoroutineState::Exec {
            self.set_state(CoroutineState::Hold);
        }
        let cur = tls::current().expect("swap_out: no current coroutine");
        tls::set_current(main.clone());

        let cur_ctx = cur.ctx.get();
        let main_ctx = main.ctx.get();
        drop(cur);
        drop(main);
        unsafe {
            arch::context_switch(cur_ctx, main_ctx);
        }
    }

    // ---------- statics ----------

    /// The coroutine currently executing on this thread (the main coroutine
    /// when no user coroutine is in)
    pub fn current() -> Arc<Coroutine> {
        if let Some(cur) = tls::current() {
            return cur;
        }
        Self::main_for_thread()
    }

    /// Like [`Coroutine::current`] without creating the main coroutine
    pub fn try_current() -> Option<Arc<Coroutine>> {
        tls::current()
    }

    /// Whether the calling thread is inside a user coroutine
    pub fn in_coroutine() -> bool {
        tls::current().map_or(false, |c| !c.is_main())
    }

    /// Mark the current coroutine READY and switch out
    pub fn yield_to_ready() {
        let cur = Self::current();
        cur.set_state(CoroutineState::Ready);
        cur.swap_out();
    }

    /// Mark the current coroutine HOLD and switch out
    pub fn yield_to_hold() {
        let cur = Self::current();
        cur.set_state(CoroutineState::Hold);
        cur.swap_out();
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("main", &self.is_main())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

/// Stack-bound entry: runs the closure under a catch-all, terminates the
/// coroutine and switches back to the main context. Never returns.
extern "C" fn coroutine_main(arg: usize) {
    let co = unsafe { &*(arg as *const Coroutine) };
    co.set_state(CoroutineState::Exec);

    let entry = unsafe { (*co.entry.get()).take() };
    if let Some(cb) = entry {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(cb)) {
            rerror!("coroutine {} panicked: {}", co.id, panic_message(&payload));
        }
    }
    co.set_state(CoroutineState::Term);

    let main = tls::main().expect("coroutine finished with no main coroutine");
    tls::set_current(main.clone());
    let main_ctx = main.ctx.get();
    let self_ctx = co.ctx.get();
    // This frame never resumes; nothing owned may be left in it.
    drop(main);
    unsafe {
        arch::context_switch(self_ctx, main_ctx);
    }
    // Switching out of a terminated coroutine must never come back.
    std::process::abort();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_run_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let co = Coroutine::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(co.state(), CoroutineState::Init);
        assert!(!co.is_main());
        assert!(co.id() > 0);

        co.swap_in();
        assert_eq!(co.state(), CoroutineState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yield_hold_and_resume() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let co = Coroutine::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
            Coroutine::yield_to_hold();
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        co.swap_in();
        assert_eq!(co.state(), CoroutineState::Hold);
        assert_eq!(steps.load(Ordering::SeqCst), 1);

        co.swap_in();
        assert_eq!(co.state(), CoroutineState::Term);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_yield_ready_preserved_across_swap_out() {
        let co = Coroutine::new(|| {
            Coroutine::yield_to_ready();
        })
        .unwrap();

        co.swap_in();
        // swap_out must not clobber the READY the coroutine pre-set
        assert_eq!(co.state(), CoroutineState::Ready);

        co.swap_in();
        assert_eq!(co.state(), CoroutineState::Term);
    }

    #[test]
    fn test_reset_reuse() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let co = Coroutine::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        co.swap_in();
        assert_eq!(co.state(), CoroutineState::Term);

        let h = hits.clone();
        co.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(co.state(), CoroutineState::Init);
        co.swap_in();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_reset_rejected_while_suspended() {
        let co = Coroutine::new(|| {
            Coroutine::yield_to_hold();
        })
        .unwrap();
        co.swap_in();
        assert_eq!(co.state(), CoroutineState::Hold);

        let err = co.reset(|| {}).unwrap_err();
        assert_eq!(err, RuntimeError::InvalidState(CoroutineState::Hold));

        // Drain it so the stack frames unwind normally
        co.swap_in();
        assert_eq!(co.state(), CoroutineState::Term);
    }

    #[test]
    fn test_reset_rejected_on_main() {
        let main = Coroutine::current();
        assert!(main.is_main());
        assert_eq!(main.reset(|| {}).unwrap_err(), RuntimeError::NoStack);
    }

    #[test]
    fn test_panic_is_contained() {
        let co = Coroutine::new(|| {
            panic!("boom inside coroutine");
        })
        .unwrap();
        co.swap_in();
        assert_eq!(co.state(), CoroutineState::Term);
        // and the test thread is still alive to assert
    }

    #[test]
    fn test_current_identity() {
        let observed = Arc::new(AtomicU64::new(0));
        let o = observed.clone();
        let co = Coroutine::new(move || {
            assert!(Coroutine::in_coroutine());
            o.store(Coroutine::current().id(), Ordering::SeqCst);
        })
        .unwrap();
        let id = co.id();
        co.swap_in();
        assert_eq!(observed.load(Ordering::SeqCst), id);

        // back on the main coroutine
        assert!(!Coroutine::in_coroutine());
        assert!(Coroutine::current().is_main());
    }

    #[test]
    fn test_total_counts_creations() {
        let before = Coroutine::total();
        let _a = Coroutine::new(|| {}).unwrap();
        let _b = Coroutine::new(|| {}).unwrap();
        assert!(Coroutine::total() >= before + 2);
    }

    #[test]
    fn test_wake_latch_claims_once() {
        let co = Coroutine::new(|| {}).unwrap();
        co.request_wake();
        assert!(co.claim_wake());
        assert!(!co.claim_wake());
    }

    #[test]
    fn test_zero_stack_size_uses_default() {
        let co = Coroutine::with_stack_size(|| {}, 0).unwrap();
        assert!(co.stack_size() >= DEFAULT_STACK_SIZE);
    }
}
