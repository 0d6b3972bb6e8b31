//! Error types for the strand runtime

use core::fmt;

use crate::state::CoroutineState;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RuntimeError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Coroutine stack allocation (mmap/mprotect) failed
    StackAlloc,

    /// Operation not allowed in the coroutine's current state
    /// (e.g. reset outside INIT/TERM)
    InvalidState(CoroutineState),

    /// Operation requires a private stack (reset on a main coroutine)
    NoStack,

    /// Failed to spawn an OS thread
    ThreadSpawn,

    /// The (fd, event) pair is already armed
    EventExists,

    /// Invalid file descriptor
    InvalidFd(i32),

    /// Multiplexer or self-pipe setup failed
    ReactorSetup(i32),

    /// Name resolution failed (getaddrinfo code)
    Resolve(i32),

    /// Raw OS error (errno)
    Os(i32),

    /// Byte buffer codec error
    Buffer(BufferError),
}

/// Errors from the byte buffer codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Read past the readable range
    Underflow,

    /// Position outside the allocated capacity
    OutOfRange,

    /// String body is not valid UTF-8
    InvalidUtf8,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Underflow => write!(f, "not enough readable data"),
            BufferError::OutOfRange => write!(f, "position out of range"),
            BufferError::InvalidUtf8 => write!(f, "string is not valid utf-8"),
        }
    }
}

impl From<BufferError> for RuntimeError {
    fn from(e: BufferError) -> Self {
        RuntimeError::Buffer(e)
    }
}

impl RuntimeError {
    /// Capture the calling thread's errno as an `Os` error
    pub fn last_os_error() -> RuntimeError {
        RuntimeError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// The errno carried by this error, if any
    pub fn os_error(&self) -> Option<i32> {
        match self {
            RuntimeError::ReactorSetup(e) | RuntimeError::Os(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::StackAlloc => write!(f, "coroutine stack allocation failed"),
            RuntimeError::InvalidState(s) => {
                write!(f, "operation not allowed in coroutine state {}", s)
            }
            RuntimeError::NoStack => write!(f, "coroutine has no private stack"),
            RuntimeError::ThreadSpawn => write!(f, "failed to spawn thread"),
            RuntimeError::EventExists => write!(f, "event already armed on this fd"),
            RuntimeError::InvalidFd(fd) => write!(f, "invalid file descriptor {}", fd),
            RuntimeError::ReactorSetup(e) => {
                write!(f, "reactor setup failed: {}", os_err_str(*e))
            }
            RuntimeError::Resolve(code) => write!(f, "name resolution failed (code {})", code),
            RuntimeError::Os(e) => write!(f, "os error: {}", os_err_str(*e)),
            RuntimeError::Buffer(e) => write!(f, "buffer error: {}", e),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Os(e.raw_os_error().unwrap_or(0))
    }
}

fn os_err_str(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", RuntimeError::StackAlloc),
            "coroutine stack allocation failed"
        );
        assert_eq!(
            format!("{}", RuntimeError::InvalidState(CoroutineState::Exec)),
            "operation not allowed in coroutine state EXEC"
        );
        assert_eq!(
            format!("{}", RuntimeError::EventExists),
            "event already armed on this fd"
        );
    }

    #[test]
    fn test_os_error_accessor() {
        assert_eq!(RuntimeError::Os(11).os_error(), Some(11));
        assert_eq!(RuntimeError::ReactorSetup(22).os_error(), Some(22));
        assert_eq!(RuntimeError::EventExists.os_error(), None);
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::from_raw_os_error(libc_eexist());
        let rt: RuntimeError = io.into();
        assert_eq!(rt, RuntimeError::Os(libc_eexist()));
    }

    fn libc_eexist() -> i32 {
        17 // EEXIST on linux
    }
}
