//! # strand-core — shared leaf types for the strand runtime
//!
//! Dependency-free building blocks used by every other crate in the
//! workspace:
//!
//! - [`CoroutineState`] — the coroutine lifecycle state machine
//! - [`IoEvent`] / [`EventMask`] — readiness event bits for the reactor
//! - [`RuntimeError`] / [`RtResult`] — the error taxonomy
//! - [`buffer::ByteBuffer`] — chained-block wire codec
//! - `rlog` — leveled stderr logging macros (`rerror!` .. `rtrace!`)
//! - `env` — typed environment-variable helpers for config overrides

pub mod buffer;
pub mod env;
pub mod error;
pub mod event;
#[macro_use]
pub mod rlog;
pub mod state;

pub use buffer::ByteBuffer;
pub use error::{BufferError, RtResult, RuntimeError};
pub use event::{EventMask, IoEvent};
pub use state::CoroutineState;
