//! Architecture-specific context switching
//!
//! Each submodule provides the same three items:
//!
//! - `Context` - the callee-saved register block for a suspended coroutine
//! - `init_context` - prime a context so the first switch enters the
//!   entry trampoline with (entry_fn, entry_arg) in scratch registers
//! - `context_switch` - save the current callee-saved state into one
//!   context and resume another
//!
//! The switch is voluntary: only the registers the ABI requires a callee to
//! preserve are saved, which is what makes it a few-nanosecond operation.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{context_switch, init_context, Context};

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{context_switch, init_context, Context};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("strand-runtime supports x86_64 and aarch64 only");

/// Entry points handed to `init_context` use this signature: a single
/// pointer-sized argument, C ABI, never returns through the trampoline.
pub type EntryFn = extern "C" fn(usize);
