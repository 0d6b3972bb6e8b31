//! Socket façade
//!
//! RAII wrapper over a socket file descriptor. Plain OS plumbing
//! (options, timeouts, bind/listen/connect) plus the blocking-looking
//! coroutine path: when an operation on a non-blocking socket would block
//! and the calling thread is inside a coroutine with a current
//! [`IoManager`], the socket arms the fd with the current coroutine and
//! yields HOLD; the reactor resumes it on readiness and the operation
//! retries. Accept counts as a read throughout, including cancellation.
//!
//! Blocking syscalls made directly inside a coroutine block the whole
//! worker thread; use non-blocking sockets or the timeout setters.

use std::io::{IoSlice, IoSliceMut};
use std::mem;

use strand_core::{rdebug, rtrace};
use strand_core::{IoEvent, RtResult, RuntimeError};
use strand_runtime::Coroutine;

use crate::address::Address;
use crate::io_manager::IoManager;

/// RAII socket wrapper
pub struct Socket {
    fd: i32,
    family: i32,
    ty: i32,
    protocol: i32,
    connected: bool,
}

impl Socket {
    /// Create a socket of the given family/type/protocol
    pub fn new(family: i32, ty: i32, protocol: i32) -> RtResult<Socket> {
        let fd = unsafe { libc::socket(family, ty | libc::SOCK_CLOEXEC, protocol) };
        if fd < 0 {
            return Err(RuntimeError::last_os_error());
        }
        let sock = Socket {
            fd,
            family,
            ty,
            protocol,
            connected: false,
        };
        sock.init_options();
        Ok(sock)
    }

    /// IPv4 TCP socket
    pub fn tcp4() -> RtResult<Socket> {
        Self::new(libc::AF_INET, libc::SOCK_STREAM, 0)
    }

    /// IPv6 TCP socket
    pub fn tcp6() -> RtResult<Socket> {
        Self::new(libc::AF_INET6, libc::SOCK_STREAM, 0)
    }

    /// IPv4 UDP socket
    pub fn udp4() -> RtResult<Socket> {
        Self::new(libc::AF_INET, libc::SOCK_DGRAM, 0)
    }

    /// IPv6 UDP socket
    pub fn udp6() -> RtResult<Socket> {
        Self::new(libc::AF_INET6, libc::SOCK_DGRAM, 0)
    }

    /// Unix-domain stream socket
    pub fn unix_stream() -> RtResult<Socket> {
        Self::new(libc::AF_UNIX, libc::SOCK_STREAM, 0)
    }

    /// Take ownership of an externally-created fd
    pub fn from_fd(fd: i32) -> RtResult<Socket> {
        if fd < 0 {
            return Err(RuntimeError::InvalidFd(fd));
        }
        let mut ty: i32 = 0;
        let mut len = mem::size_of::<i32>() as libc::socklen_t;
        unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_TYPE,
                &mut ty as *mut i32 as *mut libc::c_void,
                &mut len,
            );
        }

        let mut family = libc::AF_UNSPEC;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut slen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut slen)
        };
        if rc == 0 {
            family = storage.ss_family as i32;
        }

        let connected = {
            let mut peer: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut plen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            (unsafe { libc::getpeername(fd, &mut peer as *mut _ as *mut libc::sockaddr, &mut plen) })
                == 0
        };

        let sock = Socket {
            fd,
            family,
            ty,
            protocol: 0,
            connected,
        };
        sock.init_options();
        Ok(sock)
    }

    /// Close-on-exec is set at creation; layer on address reuse and, for
    /// TCP, Nagle off.
    fn init_options(&self) {
        let _ = self.set_option_i32(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
        if self.ty == libc::SOCK_STREAM
            && (self.family == libc::AF_INET || self.family == libc::AF_INET6)
        {
            let _ = self.set_option_i32(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
        }
    }

    // ---------- accessors ----------

    #[inline]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    #[inline]
    pub fn family(&self) -> i32 {
        self.family
    }

    #[inline]
    pub fn socket_type(&self) -> i32 {
        self.ty
    }

    #[inline]
    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    /// Pending socket error (SO_ERROR), or -1 if it cannot be read
    pub fn error(&self) -> i32 {
        let mut err: i32 = 0;
        let mut len = mem::size_of::<i32>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut i32 as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return -1;
        }
        err
    }

    pub fn local_address(&self) -> Option<Address> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return None;
        }
        Address::from_storage(&storage, len)
    }

    pub fn remote_address(&self) -> Option<Address> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return None;
        }
        Address::from_storage(&storage, len)
    }

    // ---------- options / timeouts ----------

    /// Raw getsockopt; the out buffer length is updated in place
    pub fn get_option(
        &self,
        level: i32,
        option: i32,
        value: *mut libc::c_void,
        len: &mut libc::socklen_t,
    ) -> bool {
        unsafe { libc::getsockopt(self.fd, level, option, value, len) == 0 }
    }

    /// Raw setsockopt
    pub fn set_option(
        &self,
        level: i32,
        option: i32,
        value: *const libc::c_void,
        len: libc::socklen_t,
    ) -> bool {
        unsafe { libc::setsockopt(self.fd, level, option, value, len) == 0 }
    }

    fn set_option_i32(&self, level: i32, option: i32, value: i32) -> bool {
        self.set_option(
            level,
            option,
            &value as *const i32 as *const libc::c_void,
            mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    /// Send timeout in milliseconds (-1 if it cannot be read)
    pub fn send_timeout(&self) -> i64 {
        self.timeval_option(libc::SO_SNDTIMEO)
    }

    /// Set the send timeout in milliseconds (negative clears it)
    pub fn set_send_timeout(&self, ms: i64) {
        self.set_timeval_option(libc::SO_SNDTIMEO, ms);
    }

    /// Receive timeout in milliseconds (-1 if it cannot be read)
    pub fn recv_timeout(&self) -> i64 {
        self.timeval_option(libc::SO_RCVTIMEO)
    }

    /// Set the receive timeout in milliseconds (negative clears it)
    pub fn set_recv_timeout(&self, ms: i64) {
        self.set_timeval_option(libc::SO_RCVTIMEO, ms);
    }

    fn timeval_option(&self, option: i32) -> i64 {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let mut len = mem::size_of::<libc::timeval>() as libc::socklen_t;
        if !self.get_option(
            libc::SOL_SOCKET,
            option,
            &mut tv as *mut libc::timeval as *mut libc::c_void,
            &mut len,
        ) {
            return -1;
        }
        tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000
    }

    fn set_timeval_option(&self, option: i32, ms: i64) {
        let ms = ms.max(0);
        let tv = libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        };
        self.set_option(
            libc::SOL_SOCKET,
            option,
            &tv as *const libc::timeval as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
    }

    /// Toggle O_NONBLOCK
    pub fn set_nonblocking(&self, enable: bool) -> RtResult<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(RuntimeError::last_os_error());
        }
        let flags = if enable {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } < 0 {
            return Err(RuntimeError::last_os_error());
        }
        Ok(())
    }

    // ---------- connection setup ----------

    pub fn bind(&self, addr: &Address) -> RtResult<()> {
        if addr.family() != self.family {
            return Err(RuntimeError::Os(libc::EAFNOSUPPORT));
        }
        let (sa, len) = addr.as_raw();
        if unsafe { libc::bind(self.fd, sa, len) } != 0 {
            return Err(RuntimeError::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> RtResult<()> {
        if unsafe { libc::listen(self.fd, backlog) } != 0 {
            return Err(RuntimeError::last_os_error());
        }
        Ok(())
    }

    /// Accept one connection. On a non-blocking listener inside a
    /// coroutine, suspends until the listener is readable.
    pub fn accept(&self) -> RtResult<Socket> {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let rc = unsafe {
                libc::accept(
                    self.fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if rc >= 0 {
                let sock = Socket {
                    fd: rc,
                    family: self.family,
                    ty: self.ty,
                    protocol: self.protocol,
                    connected: true,
                };
                sock.init_options();
                rtrace!("socket {}: accepted fd {}", self.fd, rc);
                return Ok(sock);
            }
            let e = last_errno();
            if e == libc::EINTR {
                continue;
            }
            if (e == libc::EAGAIN || e == libc::EWOULDBLOCK) && self.wait_readable()? {
                continue;
            }
            return Err(RuntimeError::Os(e));
        }
    }

    /// Connect, optionally bounded by a timeout.
    ///
    /// With a timeout the poll-driven helper is used. Without one, a
    /// would-block connect inside a coroutine arms WRITE readiness and
    /// yields; completion is read from SO_ERROR.
    pub fn connect(&mut self, addr: &Address, timeout_ms: Option<u64>) -> RtResult<()> {
        if addr.family() != self.family {
            return Err(RuntimeError::Os(libc::EAFNOSUPPORT));
        }
        if let Some(ms) = timeout_ms {
            connect_with_timeout(self.fd, addr, ms)?;
            self.connected = true;
            return Ok(());
        }

        let (sa, len) = addr.as_raw();
        let rc = loop {
            let rc = unsafe { libc::connect(self.fd, sa, len) };
            if rc == 0 || last_errno() != libc::EINTR {
                break rc;
            }
        };
        if rc == 0 {
            self.connected = true;
            return Ok(());
        }

        let e = last_errno();
        if e == libc::EINPROGRESS || e == libc::EAGAIN {
            if self.wait_writable()? {
                let err = self.error();
                if err == 0 {
                    self.connected = true;
                    return Ok(());
                }
                return Err(RuntimeError::Os(err));
            }
        }
        Err(RuntimeError::Os(e))
    }

    // ---------- data transfer ----------

    /// Send on a connected socket; suspends on WRITE readiness in a
    /// coroutine when the socket would block
    pub fn send(&self, buf: &[u8], flags: i32) -> RtResult<usize> {
        loop {
            let rc = unsafe {
                libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let e = last_errno();
            if e == libc::EINTR {
                continue;
            }
            if (e == libc::EAGAIN || e == libc::EWOULDBLOCK) && self.wait_writable()? {
                continue;
            }
            return Err(RuntimeError::Os(e));
        }
    }

    /// Receive on a connected socket; suspends on READ readiness in a
    /// coroutine when the socket would block
    pub fn recv(&self, buf: &mut [u8], flags: i32) -> RtResult<usize> {
        loop {
            let rc = unsafe {
                libc::recv(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    flags,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let e = last_errno();
            if e == libc::EINTR {
                continue;
            }
            if (e == libc::EAGAIN || e == libc::EWOULDBLOCK) && self.wait_readable()? {
                continue;
            }
            return Err(RuntimeError::Os(e));
        }
    }

    /// Datagram send to an explicit destination
    pub fn send_to(&self, buf: &[u8], addr: &Address, flags: i32) -> RtResult<usize> {
        let (sa, len) = addr.as_raw();
        loop {
            let rc = unsafe {
                libc::sendto(
                    self.fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    flags,
                    sa,
                    len,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let e = last_errno();
            if e == libc::EINTR {
                continue;
            }
            if (e == libc::EAGAIN || e == libc::EWOULDBLOCK) && self.wait_writable()? {
                continue;
            }
            return Err(RuntimeError::Os(e));
        }
    }

    /// Datagram receive; returns the byte count and the sender address
    pub fn recv_from(&self, buf: &mut [u8], flags: i32) -> RtResult<(usize, Option<Address>)> {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let rc = unsafe {
                libc::recvfrom(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    flags,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if rc >= 0 {
                return Ok((rc as usize, Address::from_storage(&storage, len)));
            }
            let e = last_errno();
            if e == libc::EINTR {
                continue;
            }
            if (e == libc::EAGAIN || e == libc::EWOULDBLOCK) && self.wait_readable()? {
                continue;
            }
            return Err(RuntimeError::Os(e));
        }
    }

    /// Gather-write. `IoSlice` is ABI-compatible with iovec.
    pub fn send_vectored(&self, bufs: &[IoSlice<'_>]) -> RtResult<usize> {
        loop {
            let rc = unsafe {
                libc::writev(
                    self.fd,
                    bufs.as_ptr() as *const libc::iovec,
                    bufs.len() as i32,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let e = last_errno();
            if e == libc::EINTR {
                continue;
            }
            if (e == libc::EAGAIN || e == libc::EWOULDBLOCK) && self.wait_writable()? {
                continue;
            }
            return Err(RuntimeError::Os(e));
        }
    }

    /// Scatter-read. `IoSliceMut` is ABI-compatible with iovec.
    pub fn recv_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> RtResult<usize> {
        loop {
            let rc = unsafe {
                libc::readv(
                    self.fd,
                    bufs.as_mut_ptr() as *const libc::iovec,
                    bufs.len() as i32,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let e = last_errno();
            if e == libc::EINTR {
                continue;
            }
            if (e == libc::EAGAIN || e == libc::EWOULDBLOCK) && self.wait_readable()? {
                continue;
            }
            return Err(RuntimeError::Os(e));
        }
    }

    // ---------- cancellation (delegates to the current IoManager) ----------

    /// Cancel an armed READ; its continuation runs once on a worker
    pub fn cancel_read(&self) -> bool {
        IoManager::current().map_or(false, |io| io.cancel_event(self.fd, IoEvent::Read))
    }

    /// Cancel an armed WRITE; its continuation runs once on a worker
    pub fn cancel_write(&self) -> bool {
        IoManager::current().map_or(false, |io| io.cancel_event(self.fd, IoEvent::Write))
    }

    /// Accept is a READ event; identical to [`Socket::cancel_read`]
    pub fn cancel_accept(&self) -> bool {
        self.cancel_read()
    }

    /// Cancel everything armed on this fd
    pub fn cancel_all(&self) -> bool {
        IoManager::current().map_or(false, |io| io.cancel_all(self.fd))
    }

    // ---------- teardown ----------

    /// Close the descriptor now (Drop does this too)
    pub fn close(&mut self) {
        if self.fd >= 0 {
            rtrace!("socket {}: closed", self.fd);
            unsafe { libc::close(self.fd) };
            self.fd = -1;
            self.connected = false;
        }
    }

    // ---------- suspension ----------

    /// Arm READ with the current coroutine and yield. Ok(false) when not in
    /// a coroutine / no IoManager (caller surfaces EAGAIN instead).
    fn wait_readable(&self) -> RtResult<bool> {
        self.wait_for(IoEvent::Read)
    }

    fn wait_writable(&self) -> RtResult<bool> {
        self.wait_for(IoEvent::Write)
    }

    fn wait_for(&self, ev: IoEvent) -> RtResult<bool> {
        if !Coroutine::in_coroutine() {
            return Ok(false);
        }
        let Some(io) = IoManager::current() else {
            return Ok(false);
        };
        io.add_event_coroutine(self.fd, ev, Coroutine::current())?;
        Coroutine::yield_to_hold();
        Ok(true)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd)
            .field("family", &self.family)
            .field("type", &self.ty)
            .field("connected", &self.connected)
            .finish()
    }
}

/// Connect with a millisecond timeout: flip to non-blocking if needed,
/// start the connect, poll for writability, read SO_ERROR, restore the
/// original flags.
fn connect_with_timeout(fd: i32, addr: &Address, timeout_ms: u64) -> RtResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(RuntimeError::last_os_error());
    }
    let was_nonblock = flags & libc::O_NONBLOCK != 0;
    if !was_nonblock && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(RuntimeError::last_os_error());
    }

    let result = (|| {
        let (sa, len) = addr.as_raw();
        let rc = unsafe { libc::connect(fd, sa, len) };
        if rc == 0 {
            return Ok(());
        }
        let e = last_errno();
        if e != libc::EINPROGRESS {
            return Err(RuntimeError::Os(e));
        }

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms as i32) };
            if rc == 0 {
                return Err(RuntimeError::Os(libc::ETIMEDOUT));
            }
            if rc < 0 {
                let e = last_errno();
                if e == libc::EINTR {
                    continue;
                }
                return Err(RuntimeError::Os(e));
            }
            break;
        }

        let mut err: i32 = 0;
        let mut elen = mem::size_of::<i32>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut i32 as *mut libc::c_void,
                &mut elen,
            )
        };
        if rc != 0 {
            return Err(RuntimeError::last_os_error());
        }
        if err != 0 {
            return Err(RuntimeError::Os(err));
        }
        Ok(())
    })();

    if !was_nonblock {
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            rdebug!("socket {}: failed to restore flags after connect", fd);
        }
    }
    result
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
