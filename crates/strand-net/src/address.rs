//! Network address model
//!
//! One enum over the address families the socket façade speaks: IPv4, IPv6,
//! Unix-domain and a raw fallback for anything else. Each variant wraps its
//! native sockaddr storage so it can be handed to syscalls without
//! conversion. Constructors take host-order values; the stored sockaddr is
//! network-order.
//!
//! Name resolution goes through `getaddrinfo`, interface enumeration
//! through `getifaddrs`.

use std::fmt;
use std::mem;

use strand_core::{RtResult, RuntimeError};

/// A polymorphic network address
#[derive(Clone, Copy)]
pub enum Address {
    Ip4(Ipv4Address),
    Ip6(Ipv6Address),
    Unix(UnixAddress),
    Unknown(UnknownAddress),
}

impl Address {
    /// Build an address from raw sockaddr bytes.
    ///
    /// # Safety
    ///
    /// `sa` must point to at least `len` valid bytes of a sockaddr.
    pub unsafe fn from_raw(sa: *const libc::sockaddr, len: libc::socklen_t) -> Option<Address> {
        if sa.is_null() || (len as usize) < mem::size_of::<libc::sa_family_t>() {
            return None;
        }
        match (*sa).sa_family as i32 {
            libc::AF_INET => {
                if (len as usize) < mem::size_of::<libc::sockaddr_in>() {
                    return None;
                }
                let addr = *(sa as *const libc::sockaddr_in);
                Some(Address::Ip4(Ipv4Address { addr }))
            }
            libc::AF_INET6 => {
                if (len as usize) < mem::size_of::<libc::sockaddr_in6>() {
                    return None;
                }
                let addr = *(sa as *const libc::sockaddr_in6);
                Some(Address::Ip6(Ipv6Address { addr }))
            }
            libc::AF_UNIX => {
                let mut addr: libc::sockaddr_un = mem::zeroed();
                let n = (len as usize).min(mem::size_of::<libc::sockaddr_un>());
                std::ptr::copy_nonoverlapping(sa as *const u8, &mut addr as *mut _ as *mut u8, n);
                Some(Address::Unix(UnixAddress { addr, len }))
            }
            _ => {
                let mut storage: libc::sockaddr_storage = mem::zeroed();
                let n = (len as usize).min(mem::size_of::<libc::sockaddr_storage>());
                std::ptr::copy_nonoverlapping(
                    sa as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    n,
                );
                Some(Address::Unknown(UnknownAddress { storage, len }))
            }
        }
    }

    /// Build an address from a sockaddr_storage filled by the kernel
    pub fn from_storage(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<Address> {
        unsafe { Self::from_raw(storage as *const _ as *const libc::sockaddr, len) }
    }

    /// Address family (AF_INET, AF_INET6, AF_UNIX, ...)
    pub fn family(&self) -> i32 {
        match self {
            Address::Ip4(_) => libc::AF_INET,
            Address::Ip6(_) => libc::AF_INET6,
            Address::Unix(_) => libc::AF_UNIX,
            Address::Unknown(a) => a.family(),
        }
    }

    /// Port for IP addresses, None otherwise
    pub fn port(&self) -> Option<u16> {
        match self {
            Address::Ip4(a) => Some(a.port()),
            Address::Ip6(a) => Some(a.port()),
            _ => None,
        }
    }

    /// Raw pointer and length for syscalls. The pointer borrows from self.
    pub fn as_raw(&self) -> (*const libc::sockaddr, libc::socklen_t) {
        match self {
            Address::Ip4(a) => (
                &a.addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ),
            Address::Ip6(a) => (
                &a.addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            ),
            Address::Unix(a) => (&a.addr as *const _ as *const libc::sockaddr, a.len),
            Address::Unknown(a) => (&a.storage as *const _ as *const libc::sockaddr, a.len),
        }
    }

    /// Resolve `host` ("name", "name:port", "[v6]:port", "1.2.3.4:80") to
    /// every matching address. `family`/`socktype`/`protocol` filter like
    /// the getaddrinfo hints they become; 0/AF_UNSPEC mean no restriction.
    pub fn lookup(
        host: &str,
        family: i32,
        socktype: i32,
        protocol: i32,
    ) -> RtResult<Vec<Address>> {
        let (node, service) = split_host_port(host);
        let node_c = std::ffi::CString::new(node).map_err(|_| RuntimeError::Resolve(libc::EAI_NONAME))?;
        let service_c = match service {
            Some(s) => {
                Some(std::ffi::CString::new(s).map_err(|_| RuntimeError::Resolve(libc::EAI_NONAME))?)
            }
            None => None,
        };

        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = family;
        hints.ai_socktype = socktype;
        hints.ai_protocol = protocol;

        let mut list: *mut libc::addrinfo = std::ptr::null_mut();
        let rc = unsafe {
            libc::getaddrinfo(
                node_c.as_ptr(),
                service_c.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
                &hints,
                &mut list,
            )
        };
        if rc != 0 {
            return Err(RuntimeError::Resolve(rc));
        }

        let mut out = Vec::new();
        let mut cur = list;
        while !cur.is_null() {
            let ai = unsafe { &*cur };
            if let Some(addr) = unsafe { Address::from_raw(ai.ai_addr, ai.ai_addrlen) } {
                out.push(addr);
            }
            cur = ai.ai_next;
        }
        unsafe { libc::freeaddrinfo(list) };
        Ok(out)
    }

    /// First resolution result for `host`
    pub fn lookup_any(host: &str, family: i32, socktype: i32, protocol: i32) -> RtResult<Address> {
        Self::lookup(host, family, socktype, protocol)?
            .into_iter()
            .next()
            .ok_or(RuntimeError::Resolve(libc::EAI_NONAME))
    }

    /// Enumerate local interfaces as (name, address, prefix-length).
    /// `family` filters; AF_UNSPEC returns both IPv4 and IPv6.
    pub fn interface_addresses(family: i32) -> RtResult<Vec<(String, Address, u32)>> {
        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
        if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
            return Err(RuntimeError::last_os_error());
        }

        let mut out = Vec::new();
        let mut cur = ifap;
        while !cur.is_null() {
            let ifa = unsafe { &*cur };
            cur = ifa.ifa_next;

            if ifa.ifa_addr.is_null() {
                continue;
            }
            let fam = unsafe { (*ifa.ifa_addr).sa_family } as i32;
            if fam != libc::AF_INET && fam != libc::AF_INET6 {
                continue;
            }
            if family != libc::AF_UNSPEC && fam != family {
                continue;
            }

            let len = if fam == libc::AF_INET {
                mem::size_of::<libc::sockaddr_in>()
            } else {
                mem::size_of::<libc::sockaddr_in6>()
            } as libc::socklen_t;

            let Some(addr) = (unsafe { Address::from_raw(ifa.ifa_addr, len) }) else {
                continue;
            };
            let prefix = unsafe { netmask_prefix(ifa.ifa_netmask, fam) };
            let name = unsafe { std::ffi::CStr::from_ptr(ifa.ifa_name) }
                .to_string_lossy()
                .into_owned();
            out.push((name, addr, prefix));
        }
        unsafe { libc::freeifaddrs(ifap) };
        Ok(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip4(a) => write!(f, "{}", a),
            Address::Ip6(a) => write!(f, "{}", a),
            Address::Unix(a) => write!(f, "{}", a),
            Address::Unknown(a) => write!(f, "{}", a),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip4(a) => fmt::Debug::fmt(a, f),
            Address::Ip6(a) => fmt::Debug::fmt(a, f),
            Address::Unix(a) => fmt::Debug::fmt(a, f),
            Address::Unknown(a) => fmt::Debug::fmt(a, f),
        }
    }
}

/// IPv4 address + port
#[derive(Clone, Copy)]
pub struct Ipv4Address {
    addr: libc::sockaddr_in,
}

impl Ipv4Address {
    /// From a host-order address and port
    pub fn new(ip: u32, port: u16) -> Ipv4Address {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = ip.to_be();
        Ipv4Address { addr }
    }

    /// Parse dotted-quad text
    pub fn parse(ip: &str, port: u16) -> Option<Ipv4Address> {
        let parsed: std::net::Ipv4Addr = ip.parse().ok()?;
        Some(Ipv4Address::new(u32::from(parsed), port))
    }

    /// 0.0.0.0
    pub fn any(port: u16) -> Ipv4Address {
        Ipv4Address::new(0, port)
    }

    /// 127.0.0.1
    pub fn loopback(port: u16) -> Ipv4Address {
        Ipv4Address::new(0x7f00_0001, port)
    }

    /// Host-order address
    pub fn ip(&self) -> u32 {
        u32::from_be(self.addr.sin_addr.s_addr)
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.addr.sin_port)
    }

    pub fn set_port(&mut self, port: u16) {
        self.addr.sin_port = port.to_be();
    }

    /// Network address for a prefix length (None if prefix > 32)
    pub fn network_address(&self, prefix: u32) -> Option<Ipv4Address> {
        let mask = Self::mask_bits(prefix)?;
        Some(Ipv4Address::new(self.ip() & mask, self.port()))
    }

    /// Directed broadcast address for a prefix length
    pub fn broadcast_address(&self, prefix: u32) -> Option<Ipv4Address> {
        let mask = Self::mask_bits(prefix)?;
        Some(Ipv4Address::new(self.ip() | !mask, self.port()))
    }

    /// Subnet mask for a prefix length
    pub fn subnet_mask(prefix: u32) -> Option<Ipv4Address> {
        Some(Ipv4Address::new(Self::mask_bits(prefix)?, 0))
    }

    fn mask_bits(prefix: u32) -> Option<u32> {
        match prefix {
            0 => Some(0),
            1..=32 => Some(u32::MAX << (32 - prefix)),
            _ => None,
        }
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = std::net::Ipv4Addr::from(self.ip());
        write!(f, "{}:{}", ip, self.port())
    }
}

impl fmt::Debug for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ipv4Address({})", self)
    }
}

/// IPv6 address + port
#[derive(Clone, Copy)]
pub struct Ipv6Address {
    addr: libc::sockaddr_in6,
}

impl Ipv6Address {
    pub fn new(octets: [u8; 16], port: u16) -> Ipv6Address {
        let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        addr.sin6_port = port.to_be();
        addr.sin6_addr.s6_addr = octets;
        Ipv6Address { addr }
    }

    pub fn parse(ip: &str, port: u16) -> Option<Ipv6Address> {
        let parsed: std::net::Ipv6Addr = ip.parse().ok()?;
        Some(Ipv6Address::new(parsed.octets(), port))
    }

    /// ::
    pub fn any(port: u16) -> Ipv6Address {
        Ipv6Address::new([0; 16], port)
    }

    /// ::1
    pub fn loopback(port: u16) -> Ipv6Address {
        let mut octets = [0u8; 16];
        octets[15] = 1;
        Ipv6Address::new(octets, port)
    }

    pub fn octets(&self) -> [u8; 16] {
        self.addr.sin6_addr.s6_addr
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.addr.sin6_port)
    }

    pub fn set_port(&mut self, port: u16) {
        self.addr.sin6_port = port.to_be();
    }

    /// Network address for a prefix length (None if prefix > 128)
    pub fn network_address(&self, prefix: u32) -> Option<Ipv6Address> {
        if prefix > 128 {
            return None;
        }
        let mut octets = self.octets();
        let full = (prefix / 8) as usize;
        let rem = prefix % 8;
        if full < 16 {
            if rem > 0 {
                octets[full] &= 0xffu8 << (8 - rem);
                for b in octets.iter_mut().skip(full + 1) {
                    *b = 0;
                }
            } else {
                for b in octets.iter_mut().skip(full) {
                    *b = 0;
                }
            }
        }
        Some(Ipv6Address::new(octets, self.port()))
    }
}

impl fmt::Display for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = std::net::Ipv6Addr::from(self.octets());
        write!(f, "[{}]:{}", ip, self.port())
    }
}

impl fmt::Debug for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ipv6Address({})", self)
    }
}

/// Unix-domain socket address
#[derive(Clone, Copy)]
pub struct UnixAddress {
    addr: libc::sockaddr_un,
    len: libc::socklen_t,
}

impl UnixAddress {
    pub fn new(path: &str) -> RtResult<UnixAddress> {
        let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

        let bytes = path.as_bytes();
        if bytes.len() >= addr.sun_path.len() {
            return Err(RuntimeError::Os(libc::ENAMETOOLONG));
        }
        for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        let len =
            (mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
        Ok(UnixAddress { addr, len })
    }

    pub fn path(&self) -> String {
        let bytes: Vec<u8> = self
            .addr
            .sun_path
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl fmt::Display for UnixAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unix:{}", self.path())
    }
}

impl fmt::Debug for UnixAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnixAddress({})", self.path())
    }
}

/// Any family the model does not understand, kept as raw bytes
#[derive(Clone, Copy)]
pub struct UnknownAddress {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl UnknownAddress {
    pub fn family(&self) -> i32 {
        self.storage.ss_family as i32
    }
}

impl fmt::Display for UnknownAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown(family={})", self.family())
    }
}

impl fmt::Debug for UnknownAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnknownAddress(family={})", self.family())
    }
}

/// Split "host[:port]" / "[v6]:port" into node and service strings. A bare
/// IPv6 literal (multiple colons, no brackets) is all node.
fn split_host_port(host: &str) -> (String, Option<String>) {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let node = rest[..close].to_string();
            let tail = &rest[close + 1..];
            if let Some(port) = tail.strip_prefix(':') {
                return (node, Some(port.to_string()));
            }
            return (node, None);
        }
    }
    if host.matches(':').count() == 1 {
        if let Some((node, port)) = host.rsplit_once(':') {
            return (node.to_string(), Some(port.to_string()));
        }
    }
    (host.to_string(), None)
}

unsafe fn netmask_prefix(mask: *const libc::sockaddr, family: i32) -> u32 {
    if mask.is_null() {
        return 0;
    }
    match family {
        libc::AF_INET => {
            let sin = &*(mask as *const libc::sockaddr_in);
            u32::from_be(sin.sin_addr.s_addr).count_ones()
        }
        libc::AF_INET6 => {
            let sin6 = &*(mask as *const libc::sockaddr_in6);
            sin6.sin6_addr
                .s6_addr
                .iter()
                .map(|b| b.count_ones())
                .sum()
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_roundtrip() {
        let a = Ipv4Address::parse("192.168.1.10", 8080).unwrap();
        assert_eq!(a.ip(), 0xc0a8_010a);
        assert_eq!(a.port(), 8080);
        assert_eq!(a.to_string(), "192.168.1.10:8080");

        let mut b = Ipv4Address::loopback(0);
        b.set_port(443);
        assert_eq!(b.to_string(), "127.0.0.1:443");
    }

    #[test]
    fn test_ipv4_prefix_math() {
        let a = Ipv4Address::parse("192.168.1.10", 0).unwrap();
        assert_eq!(a.network_address(24).unwrap().to_string(), "192.168.1.0:0");
        assert_eq!(
            a.broadcast_address(24).unwrap().to_string(),
            "192.168.1.255:0"
        );
        assert_eq!(
            Ipv4Address::subnet_mask(24).unwrap().to_string(),
            "255.255.255.0:0"
        );
        assert!(a.network_address(33).is_none());
        assert_eq!(a.network_address(0).unwrap().to_string(), "0.0.0.0:0");
    }

    #[test]
    fn test_ipv6_roundtrip() {
        let a = Ipv6Address::parse("fe80::1", 9000).unwrap();
        assert_eq!(a.port(), 9000);
        assert_eq!(a.to_string(), "[fe80::1]:9000");

        let net = a.network_address(64).unwrap();
        assert_eq!(net.to_string(), "[fe80::]:9000");
        assert!(a.network_address(129).is_none());
    }

    #[test]
    fn test_unix_address() {
        let a = UnixAddress::new("/tmp/strand.sock").unwrap();
        assert_eq!(a.path(), "/tmp/strand.sock");
        assert_eq!(a.to_string(), "unix:/tmp/strand.sock");

        let too_long = "x".repeat(200);
        assert!(UnixAddress::new(&too_long).is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:80"),
            ("example.com".to_string(), Some("80".to_string()))
        );
        assert_eq!(split_host_port("example.com"), ("example.com".to_string(), None));
        assert_eq!(
            split_host_port("[::1]:443"),
            ("::1".to_string(), Some("443".to_string()))
        );
        assert_eq!(split_host_port("fe80::1"), ("fe80::1".to_string(), None));
    }

    #[test]
    fn test_lookup_numeric() {
        let addrs = Address::lookup("127.0.0.1:80", libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        assert!(!addrs.is_empty());
        match addrs[0] {
            Address::Ip4(a) => {
                assert_eq!(a.to_string(), "127.0.0.1:80");
            }
            _ => panic!("expected an IPv4 result"),
        }
        assert_eq!(addrs[0].family(), libc::AF_INET);
        assert_eq!(addrs[0].port(), Some(80));
    }

    #[test]
    fn test_lookup_failure() {
        let err =
            Address::lookup("definitely-not-a-host.invalid.", libc::AF_INET, 0, 0).unwrap_err();
        assert!(matches!(err, RuntimeError::Resolve(_)));
    }

    #[test]
    fn test_interface_enumeration() {
        // Environment-dependent; the walk itself must succeed and yield
        // well-formed entries
        let ifs = Address::interface_addresses(libc::AF_UNSPEC).unwrap();
        for (name, addr, prefix) in &ifs {
            assert!(!name.is_empty());
            match addr {
                Address::Ip4(_) => assert!(*prefix <= 32),
                Address::Ip6(_) => assert!(*prefix <= 128),
                _ => panic!("interface walk returned a non-IP address"),
            }
        }
    }

    #[test]
    fn test_from_storage() {
        let v4 = Ipv4Address::loopback(1234);
        let (raw, len) = Address::Ip4(v4).as_raw();
        let got = unsafe { Address::from_raw(raw, len) }.unwrap();
        assert_eq!(got.to_string(), "127.0.0.1:1234");
    }
}
