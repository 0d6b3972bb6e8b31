//! Coroutine stack allocation
//!
//! Each coroutine owns a private mmap'd region with a PROT_NONE guard page
//! at the low end, so running off the stack faults instead of corrupting
//! the neighbouring allocation. Stacks grow down from `top()`.

use strand_core::{RtResult, RuntimeError};

/// An exclusively-owned stack mapping
pub struct Stack {
    base: *mut u8,
    total: usize,
    usable: usize,
}

// The mapping is owned by exactly one coroutine and only ever used from the
// thread that coroutine is running on.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack of at least `size` usable bytes (rounded up to whole
    /// pages) plus one guard page.
    pub fn new(size: usize) -> RtResult<Stack> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::StackAlloc);
        }
        let base = base as *mut u8;

        // Guard page at the low end; the stack grows down toward it
        let rc = unsafe { libc::mprotect(base as *mut libc::c_void, page, libc::PROT_NONE) };
        if rc != 0 {
            unsafe { libc::munmap(base as *mut libc::c_void, total) };
            return Err(RuntimeError::StackAlloc);
        }

        Ok(Stack {
            base,
            total,
            usable,
        })
    }

    /// High end of the mapping; initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (excludes the guard page)
    #[inline]
    pub fn size(&self) -> usize {
        self.usable
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_alloc() {
        let stack = Stack::new(128 * 1024).unwrap();
        assert!(stack.size() >= 128 * 1024);
        assert!(!stack.top().is_null());

        // The usable region is writable right below the top
        unsafe {
            let p = stack.top().sub(8);
            std::ptr::write_volatile(p as *mut u64, 0xdead_beef);
            assert_eq!(std::ptr::read_volatile(p as *const u64), 0xdead_beef);
        }
    }

    #[test]
    fn test_stack_rounds_to_pages() {
        let stack = Stack::new(1).unwrap();
        assert!(stack.size() >= 1);
        assert_eq!(stack.size() % page_size(), 0);
    }
}
