//! x86_64 context switching
//!
//! Inline naked assembly, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register block (System V AMD64)
///
/// Field order is fixed: the assembly below addresses fields by byte offset.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prime `ctx` so that switching into it enters `entry_fn(entry_arg)` on the
/// given stack.
///
/// The stack pointer is aligned down to 16 bytes; the trampoline's `call`
/// then leaves `rsp % 16 == 8` at the entry function, as the ABI requires.
///
/// # Safety
///
/// `ctx` must point to valid `Context` memory and `stack_top` to the high
/// end of a live, exclusively-owned stack mapping.
#[inline]
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64; // entry function
    ctx.r13 = entry_arg as u64; // entry argument
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First code to run on a fresh coroutine stack: move the argument into
/// place and call the entry function. The entry function performs the final
/// switch back to the main context itself; falling through it means that
/// switch is gone, so trap.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {fallthrough}",
        "ud2",
        fallthrough = sym entry_fallthrough,
    );
}

extern "C" fn entry_fallthrough() -> ! {
    // The entry function returned instead of switching out: the main
    // context for this thread is unrecoverable.
    std::process::abort()
}

/// Save callee-saved state into `old`, resume `new`.
///
/// Returns (to the caller of the *old* context) when some other party
/// switches back into `old`.
///
/// # Safety
///
/// Both pointers must reference valid `Context` blocks; `new` must hold
/// either state saved by a previous switch or state primed by
/// [`init_context`].
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save callee-saved registers into old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the saved resume point
        "jmp rax",
        // Resume point for a context saved by this function
        "1:",
        "ret",
    );
}
