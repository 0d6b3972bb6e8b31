//! # strand-runtime — stackful coroutines on a worker-pool scheduler
//!
//! The execution core of the strand workspace:
//!
//! - [`Coroutine`] — stackful user-level execution unit with symmetric
//!   context switches against a per-thread main coroutine
//! - [`Scheduler`] — fixed pool of worker threads draining an
//!   affinity-aware FIFO of coroutines and callables
//! - [`Thread`] — named OS thread with a startup handshake and per-thread
//!   identity
//! - [`RuntimeConfig`] — env/YAML-configurable knobs
//!
//! The I/O reactor that specializes the scheduler lives in `strand-net`.
//!
//! ## Quick start
//!
//! ```ignore
//! use strand_runtime::{Coroutine, Scheduler};
//!
//! let sched = Scheduler::new(4, false, "pool");
//! sched.start();
//! sched.submit(|| {
//!     println!("runs inside a coroutine and may yield");
//!     Coroutine::yield_to_ready();
//!     println!("resumed");
//! });
//! sched.stop();
//! ```

pub mod arch;
pub mod config;
pub mod coroutine;
pub mod scheduler;
pub mod stack;
pub mod thread;
mod tls;

pub use config::{ConfigError, RuntimeConfig};
pub use coroutine::{Coroutine, DEFAULT_STACK_SIZE};
pub use scheduler::{Scheduler, Task, TaskFn};
pub use thread::Thread;

// Re-export the shared leaf types alongside the runtime
pub use strand_core::{CoroutineState, EventMask, IoEvent, RtResult, RuntimeError};
