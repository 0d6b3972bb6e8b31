//! # strand — blocking-looking network code on stackful coroutines
//!
//! A single-process, multi-threaded coroutine runtime with an event-driven
//! I/O reactor. Application code is written as ordinary sequential
//! functions; the runtime multiplexes them onto a fixed pool of worker
//! threads, suspending them on fd readiness instead of blocking the
//! kernel thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                      User Code                        │
//! │        submit(), Socket::recv(), yield_to_ready()     │
//! └───────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌───────────────────────────────────────────────────────┐
//! │                      IoManager                        │
//! │     FIFO task queue + epoll reactor + self-pipe       │
//! └───────────────────────────────────────────────────────┘
//!          │                 │                 │
//!          ▼                 ▼                 ▼
//!    ┌───────────┐     ┌───────────┐     ┌───────────┐
//!    │  Worker   │     │  Worker   │     │  Reactor  │
//!    │  Thread   │     │  Thread   │     │  Thread   │
//!    └───────────┘     └───────────┘     └───────────┘
//!          │                 │
//!          └────────┬────────┘
//!                   ▼
//!    ┌───────────────────────────────────┐
//!    │   Coroutines: 128 KiB mmap'd      │
//!    │   stacks, guard pages, ~ns switch │
//!    └───────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use strand::{Runtime, RuntimeConfig};
//!
//! fn main() {
//!     let rt = Runtime::new(RuntimeConfig::from_env()).unwrap();
//!     rt.start();
//!     rt.submit(|| {
//!         println!("hello from a coroutine");
//!         strand::Coroutine::yield_to_ready();
//!         println!("resumed");
//!     });
//!     rt.stop();
//! }
//! ```

use std::sync::Arc;

// Core types
pub use strand_core::{
    BufferError, ByteBuffer, CoroutineState, EventMask, IoEvent, RtResult, RuntimeError,
};
pub use strand_core::rlog::{set_flush_enabled, set_log_level, LogLevel};

// Runtime
pub use strand_runtime::{
    ConfigError, Coroutine, RuntimeConfig, Scheduler, Task, Thread, DEFAULT_STACK_SIZE,
};

// Net
pub use strand_net::{
    Address, IoManager, Ipv4Address, Ipv6Address, Socket, UnixAddress, UnknownAddress,
};

/// Owning handle over an [`IoManager`]: start, submit, stop, and stop again
/// on drop. The typical application entry point.
pub struct Runtime {
    io: Arc<IoManager>,
}

impl Runtime {
    /// Build a stopped runtime from a configuration
    pub fn new(config: RuntimeConfig) -> RtResult<Runtime> {
        Ok(Runtime {
            io: IoManager::with_config(config)?,
        })
    }

    /// Start workers and the reactor
    pub fn start(&self) {
        self.io.start();
    }

    /// Submit a callable; it runs inside a coroutine and may suspend
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.io.submit(f);
    }

    /// Submit an explicit coroutine
    pub fn submit_coroutine(&self, co: Arc<Coroutine>) {
        self.io.submit_coroutine(co);
    }

    /// The underlying I/O manager
    pub fn io(&self) -> &Arc<IoManager> {
        &self.io
    }

    /// Cooperative shutdown: wake everything, join workers and reactor
    pub fn stop(&self) {
        self.io.stop();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Yield the current coroutine as READY (it is re-enqueued by the
/// dispatcher); outside a coroutine this is a no-op on the main context
pub fn yield_ready() {
    if Coroutine::in_coroutine() {
        Coroutine::yield_to_ready();
    } else {
        std::thread::yield_now();
    }
}

/// Whether the calling thread is currently inside a coroutine
pub fn in_coroutine() -> bool {
    Coroutine::in_coroutine()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn test_runtime_lifecycle() {
        let rt = Runtime::new(RuntimeConfig::new().workers(2).name("facade")).unwrap();
        rt.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        rt.submit(move || {
            yield_ready();
            h.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        rt.stop();
    }

    #[test]
    fn test_yield_ready_outside_coroutine() {
        assert!(!in_coroutine());
        yield_ready();
    }
}
