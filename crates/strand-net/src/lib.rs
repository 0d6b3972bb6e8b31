//! # strand-net — the I/O side of the strand runtime
//!
//! Specializes the `strand-runtime` scheduler with an epoll reactor and
//! provides the OS plumbing around it:
//!
//! - [`IoManager`] — scheduler + readiness multiplexer; arms per-fd
//!   READ/WRITE events carrying a continuation (callable or coroutine) and
//!   turns readiness into task submissions
//! - [`Address`] — IPv4/IPv6/Unix/unknown address model with name
//!   resolution and interface enumeration
//! - [`Socket`] — RAII fd wrapper with timeouts and blocking-looking
//!   coroutine I/O
//!
//! ## Quick start
//!
//! ```ignore
//! use strand_net::{Address, IoManager, Ipv4Address, Socket};
//!
//! let io = IoManager::new(2, false, "io").unwrap();
//! io.start();
//! io.submit(|| {
//!     let listener = Socket::tcp4().unwrap();
//!     listener.bind(&Address::Ip4(Ipv4Address::any(9000))).unwrap();
//!     listener.listen(128).unwrap();
//!     listener.set_nonblocking(true).unwrap();
//!     loop {
//!         let client = listener.accept().unwrap(); // suspends, not blocks
//!         // ... serve client in another coroutine
//!     }
//! });
//! ```

pub mod address;
pub mod io_manager;
pub mod socket;

pub use address::{Address, Ipv4Address, Ipv6Address, UnixAddress, UnknownAddress};
pub use io_manager::IoManager;
pub use socket::Socket;

// Re-export what callers need alongside the reactor
pub use strand_core::{EventMask, IoEvent, RtResult, RuntimeError};
pub use strand_runtime::{Coroutine, CoroutineState, RuntimeConfig, Scheduler};
