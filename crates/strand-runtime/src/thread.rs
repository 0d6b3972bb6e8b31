//! Named OS thread wrapper
//!
//! Adds three things over `std::thread`: a startup handshake so the
//! constructor returns only after the spawned thread has published its
//! kernel thread id, per-thread identity (name + tid) readable from
//! anywhere, and a catch-all around the closure so a panic is logged
//! instead of poisoning the process.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::JoinHandle;

use strand_core::{rdebug, rerror};
use strand_core::{RtResult, RuntimeError};

thread_local! {
    /// Human-readable name of the current thread
    static THREAD_NAME: RefCell<String> = const { RefCell::new(String::new()) };

    /// Cached kernel thread id of the current thread (0 = not yet read)
    static THREAD_ID: Cell<u32> = const { Cell::new(0) };
}

/// A named OS thread
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    id: u32,
    name: String,
}

impl Thread {
    /// Spawn a named thread and wait for it to publish its kernel id.
    pub fn spawn<F>(name: &str, f: F) -> RtResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.to_string();
        let inner_name = name.clone();
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                Thread::set_current_name(&inner_name);
                let tid = Thread::current_id();
                // Handshake: the constructor blocks until the id arrives
                let _ = tx.send(tid);

                if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                    rerror!(
                        "thread {} panicked: {}",
                        inner_name,
                        panic_message(&payload)
                    );
                }

                THREAD_NAME.with(|n| n.borrow_mut().clear());
            })
            .map_err(|_| RuntimeError::ThreadSpawn)?;

        let id = rx.recv().map_err(|_| RuntimeError::ThreadSpawn)?;
        Ok(Thread {
            handle: Some(handle),
            id,
            name,
        })
    }

    /// Kernel thread id of this wrapper's thread
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish. Join failures are logged, not raised:
    /// the wrapper is usually joined from shutdown paths that must not fail.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                rerror!("thread {}: join observed a panic", self.name);
            }
        }
    }

    /// Kernel thread id of the calling thread
    pub fn current_id() -> u32 {
        let cached = THREAD_ID.with(|c| c.get());
        if cached != 0 {
            return cached;
        }
        let id = os_thread_id();
        THREAD_ID.with(|c| c.set(id));
        id
    }

    /// Name of the calling thread as set through this wrapper
    pub fn current_name() -> String {
        THREAD_NAME.with(|n| n.borrow().clone())
    }

    /// Set the calling thread's name: thread-local always, native name
    /// best-effort (truncated to the 15-character pthread limit on Linux).
    pub fn set_current_name(name: &str) {
        THREAD_NAME.with(|n| *n.borrow_mut() = name.to_string());

        #[cfg(target_os = "linux")]
        {
            let truncated: String = name.chars().take(15).collect();
            if let Ok(cname) = std::ffi::CString::new(truncated) {
                unsafe {
                    libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
                }
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Detach rather than join: dropping a JoinHandle detaches, and a
        // drop-time join could deadlock a shutdown path.
        if self.handle.is_some() {
            rdebug!("thread {} detached on drop", self.name);
        }
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("joined", &self.handle.is_none())
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn os_thread_id() -> u32 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u32
}

#[cfg(not(target_os = "linux"))]
fn os_thread_id() -> u32 {
    // No portable kernel tid; hash the std thread id instead
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    let h = hasher.finish() as u32;
    if h == 0 {
        1
    } else {
        h
    }
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
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spawn_join_and_identity() {
        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        let mut t = Thread::spawn("strand-test-thr", move || {
            assert_eq!(Thread::current_name(), "strand-test-thr");
            s.store(Thread::current_id(), Ordering::SeqCst);
        })
        .unwrap();

        // Handshake guarantees the id is known before the closure finishes
        assert_ne!(t.id(), 0);
        assert_eq!(t.name(), "strand-test-thr");

        t.join();
        assert_eq!(seen.load(Ordering::SeqCst), t.id());
    }

    #[test]
    fn test_id_differs_from_spawner() {
        let mut t = Thread::spawn("strand-test-other", || {}).unwrap();
        assert_ne!(t.id(), Thread::current_id());
        t.join();
    }

    #[test]
    fn test_panic_contained() {
        let mut t = Thread::spawn("strand-test-panic", || {
            panic!("thread body panic");
        })
        .unwrap();
        t.join();
    }

    #[test]
    fn test_long_name_truncated_native() {
        let long = "strand-test-very-long-thread-name";
        let mut t = Thread::spawn(long, move || {
            // Thread-local name keeps the full string
            assert_eq!(Thread::current_name(), long);
        })
        .unwrap();
        assert_eq!(t.name(), long);
        t.join();
    }
}
