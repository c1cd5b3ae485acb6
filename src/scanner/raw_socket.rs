//! Raw TCP sockets (`SOCK_RAW / IPPROTO_TCP`) for sending probes and
//! capturing replies.
//!
//! Requires `CAP_NET_RAW`. The outbound socket is bound to the local address
//! and connected to the target so plain `send()` routes every probe; the
//! kernel builds the IP header. The inbound socket is bound to the local
//! address and sees a copy of every TCP packet delivered to it. On IPv4 the
//! kernel hands readers the whole datagram, so the IP header is stripped
//! before the payload is returned.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use super::packet::ipv4_payload_offset;
use super::syn_sender::ScanError;
use super::transport::{PacketSink, PacketSource, RawTransport};
use crate::NetworkProtocol;

/// Read timeout on the listening socket. Bounds how long the receiver can
/// take to notice cancellation.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Offset of the TCP checksum field, for `IPV6_CHECKSUM`.
const TCP_CHECKSUM_OFFSET: libc::c_int = 16;

/// `IPV6_CHECKSUM` from `<linux/in6.h>`.
const IPV6_CHECKSUM: libc::c_int = 7;

/// Opens real raw sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSocketTransport;

impl RawSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl RawTransport for RawSocketTransport {
    fn dial(
        &self,
        local: IpAddr,
        remote: IpAddr,
        protocol: NetworkProtocol,
    ) -> Result<Box<dyn PacketSink>, ScanError> {
        let dial_err = |e: io::Error| ScanError::Dial(format!("{local} -> {remote}: {e}"));

        let sock = RawFd::open(protocol).map_err(dial_err)?;
        if protocol == NetworkProtocol::Ipv6 {
            // Let the kernel fill the checksum over the IPv6 pseudo-header.
            sock.set_int_option(libc::IPPROTO_IPV6, IPV6_CHECKSUM, TCP_CHECKSUM_OFFSET)
                .map_err(dial_err)?;
        }
        sock.bind(local).map_err(dial_err)?;
        sock.connect(remote).map_err(dial_err)?;

        tracing::debug!(%local, %remote, network = %format!("{protocol}:tcp"), "dialed raw socket");
        Ok(Box::new(RawSink { sock }))
    }

    fn listen(
        &self,
        local: IpAddr,
        protocol: NetworkProtocol,
    ) -> Result<Box<dyn PacketSource>, ScanError> {
        let listen_err = |e: io::Error| ScanError::Listen(format!("{local}: {e}"));

        let sock = RawFd::open(protocol).map_err(listen_err)?;
        sock.bind(local).map_err(listen_err)?;
        sock.set_read_timeout(READ_TIMEOUT).map_err(listen_err)?;

        tracing::debug!(%local, network = %format!("{protocol}:tcp"), "listening on raw socket");
        Ok(Box::new(RawSource { sock, protocol }))
    }
}

// =============================================================================
// File descriptor wrapper
// =============================================================================

/// Owned raw socket; closed on drop.
struct RawFd {
    fd: libc::c_int,
}

impl RawFd {
    fn open(protocol: NetworkProtocol) -> io::Result<Self> {
        let domain = match protocol {
            NetworkProtocol::Ipv4 => libc::AF_INET,
            NetworkProtocol::Ipv6 => libc::AF_INET6,
        };
        let fd = unsafe { libc::socket(domain, libc::SOCK_RAW, libc::IPPROTO_TCP) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    fn bind(&self, addr: IpAddr) -> io::Result<()> {
        let (storage, len) = to_sockaddr(addr);
        let ret = unsafe {
            libc::bind(
                self.fd,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        check(ret)
    }

    fn connect(&self, addr: IpAddr) -> io::Result<()> {
        let (storage, len) = to_sockaddr(addr);
        let ret = unsafe {
            libc::connect(
                self.fd,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        check(ret)
    }

    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        check(ret)
    }

    fn set_int_option(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        check(ret)
    }
}

impl Drop for RawFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Encode `addr` (port 0) as a `sockaddr_storage`.
fn to_sockaddr(addr: IpAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        IpAddr::V4(v4) => {
            // s_addr is network byte order in memory, i.e. the octets as-is.
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 0,
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_storage is large enough and suitably aligned for sockaddr_in.
            unsafe {
                std::ptr::write(
                    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in,
                    sin,
                )
            };
            mem::size_of::<libc::sockaddr_in>()
        }
        IpAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: 0,
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.octets(),
                },
                sin6_scope_id: 0,
            };
            // SAFETY: as above, for sockaddr_in6.
            unsafe {
                std::ptr::write(
                    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6,
                    sin6,
                )
            };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Decode the address of a `sockaddr_storage` filled in by the kernel.
fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<IpAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: ss_family says the storage holds a sockaddr_in.
            let sin = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
            };
            Some(IpAddr::V4(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes())))
        }
        libc::AF_INET6 => {
            // SAFETY: ss_family says the storage holds a sockaddr_in6.
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

// =============================================================================
// Sink / source
// =============================================================================

struct RawSink {
    sock: RawFd,
}

impl PacketSink for RawSink {
    fn send(&mut self, segment: &[u8]) -> Result<usize, ScanError> {
        let ret = unsafe {
            libc::send(
                self.sock.fd,
                segment.as_ptr() as *const libc::c_void,
                segment.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(ScanError::Send(format!(
                "raw socket send failed: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(ret as usize)
    }
}

struct RawSource {
    sock: RawFd,
    protocol: NetworkProtocol,
}

impl PacketSource for RawSource {
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, IpAddr)>, ScanError> {
        // SAFETY: zeroed sockaddr_storage is valid; the kernel fills it in.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let ret = unsafe {
            libc::recvfrom(
                self.sock.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    Ok(None)
                }
                _ => Err(ScanError::Read(format!("raw socket recv failed: {err}"))),
            };
        }

        let n = ret as usize;
        let from = from_sockaddr(&storage)
            .ok_or_else(|| ScanError::Read(format!("unknown address family {}", storage.ss_family)))?;

        if self.protocol == NetworkProtocol::Ipv4 {
            let offset = ipv4_payload_offset(&buf[..n])
                .ok_or_else(|| ScanError::Read(format!("malformed IPv4 header from {from}")))?;
            buf.copy_within(offset..n, 0);
            return Ok(Some((n - offset, from)));
        }
        Ok(Some((n, from)))
    }
}

// =============================================================================
// Tests
// =============================================================================
