//! Thread-local coroutine context
//!
//! Every thread that touches coroutines carries two pointers: the coroutine
//! currently executing and the thread's main coroutine (the coroutine that
//! stands for the thread's ambient context, created lazily on first use).
//!
//! Accessors clone the Arc out and return immediately; no borrow is ever
//! held across a context switch.

use std::cell::RefCell;
use std::sync::Arc;

use crate::coroutine::Coroutine;

thread_local! {
    /// Coroutine currently executing on this thread
    static CURRENT: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };

    /// This thread's main coroutine
    static MAIN: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
}

#[inline]
pub(crate) fn current() -> Option<Arc<Coroutine>> {
    CURRENT.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_current(co: Arc<Coroutine>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(co));
}

#[inline]
pub(crate) fn main() -> Option<Arc<Coroutine>> {
    MAIN.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_main(co: Arc<Coroutine>) {
    MAIN.with(|c| *c.borrow_mut() = Some(co));
}
