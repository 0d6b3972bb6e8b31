//! Leveled runtime logging over stderr
//!
//! The runtime must be able to log from worker threads, from inside
//! coroutines and from the reactor without taking any runtime lock, so this
//! is a self-contained sink: a locked stderr write per line, an atomic level
//! gate, and optional per-line flushing for crash debugging.
//!
//! # Environment Variables
//!
//! - `STRAND_LOG_LEVEL=<level>` - off | error | warn | info | debug | trace (or 0..5)
//! - `STRAND_LOG_FLUSH=1` - flush stderr after every line

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, ordered by verbosity
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize logging from environment variables.
///
/// Called automatically on first use; call explicitly for deterministic
/// startup ordering.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("STRAND_LOG_FLUSH") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("STRAND_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set the log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Set flush-per-line programmatically
pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether a level would currently be emitted
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

#[doc(hidden)]
pub fn _rlog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log
#[macro_export]
macro_rules! rerror {
    ($($arg:tt)*) => {{
        $crate::rlog::_rlog_impl(
            $crate::rlog::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! rwarn {
    ($($arg:tt)*) => {{
        $crate::rlog::_rlog_impl(
            $crate::rlog::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! rinfo {
    ($($arg:tt)*) => {{
        $crate::rlog::_rlog_impl(
            $crate::rlog::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! rdebug {
    ($($arg:tt)*) => {{
        $crate::rlog::_rlog_impl(
            $crate::rlog::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! rtrace {
    ($($arg:tt)*) => {{
        $crate::rlog::_rlog_impl(
            $crate::rlog::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_from_u8() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(3), LogLevel::Info);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);

        rerror!("error {}", "msg");
        rwarn!("warn");
        rinfo!("info {}", 1);
        rdebug!("debug");
        rtrace!("trace");
    }
}
