//! Thin non-blocking socket wrapper over raw file descriptors.
//!
//! Everything the transports need from the OS lives here: datagram and
//! stream sockets opened non-blocking, the socket options that must be set
//! before bind, and `recvmsg` with control messages so the receive path can
//! see the TOS/ECN octet of each datagram. This is the only module in the
//! crate with unsafe code.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use crate::transport::timing::timestamp;

/// ECT(0): ECN-capable transport, so the path may mark CE instead of drop.
const TOS_ECT0: libc::c_int = 0x02;

/// CE mark in the low two TOS bits.
const ECN_CE_MASK: u8 = 0x03;

/// An owned non-blocking socket file descriptor.
///
/// Closed on drop. Records when it was opened so the datagram pool can
/// prune sockets by age.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: RawFd,
    opened_at: u64,
}

/// One received datagram plus its ancillary data.
#[derive(Debug)]
pub(crate) struct Datagram {
    /// Bytes received.
    pub len: usize,
    /// Source address, when the kernel reported one.
    pub from: Option<SocketAddr>,
    /// The datagram carried a congestion-experienced ECN mark.
    pub congestion_experienced: bool,
    /// The datagram exceeded the receive buffer and was cut short.
    pub truncated: bool,
}

impl Socket {
    fn new(family: libc::c_int, socktype: libc::c_int) -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                family,
                socktype | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Socket {
            fd,
            opened_at: timestamp(),
        })
    }

    /// Open a UDP socket for the given family.
    pub fn udp(v6: bool) -> io::Result<Self> {
        Socket::new(
            if v6 { libc::AF_INET6 } else { libc::AF_INET },
            libc::SOCK_DGRAM,
        )
    }

    /// Open a TCP socket for the given family.
    pub fn tcp(v6: bool) -> io::Result<Self> {
        Socket::new(
            if v6 { libc::AF_INET6 } else { libc::AF_INET },
            libc::SOCK_STREAM,
        )
    }

    /// The raw descriptor, for the caller's readiness multiplexer.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// When this socket was opened, on the monotonic millisecond clock.
    pub fn opened_at(&self) -> u64 {
        self.opened_at
    }

    fn setsockopt<T>(&self, level: libc::c_int, name: libc::c_int, value: T) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                &value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Disable path MTU discovery; the transport fragments to its own MTU
    /// and must not have the kernel set DF.
    pub fn disable_path_mtu_discovery(&self) -> io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            self.setsockopt(
                libc::IPPROTO_IP,
                libc::IP_MTU_DISCOVER,
                libc::IP_PMTUDISC_DONT,
            )
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            Ok(())
        }
    }

    /// Mark outgoing datagrams ECN-capable (ECT(0)).
    pub fn set_ecn_capable(&self, v6: bool) {
        // Refusal is survivable; we just lose ECN on this socket.
        let _ = if v6 {
            self.setsockopt(libc::IPPROTO_IPV6, libc::IPV6_TCLASS, TOS_ECT0)
        } else {
            self.setsockopt(libc::IPPROTO_IP, libc::IP_TOS, TOS_ECT0)
        };
    }

    /// Request the TOS / traffic-class octet of received datagrams as
    /// ancillary data.
    pub fn request_ecn(&self, v6: bool) {
        let on: libc::c_int = 1;
        let _ = if v6 {
            self.setsockopt(libc::IPPROTO_IPV6, libc::IPV6_RECVTCLASS, on)
        } else {
            self.setsockopt(libc::IPPROTO_IP, libc::IP_RECVTOS, on)
        };
    }

    /// Allow or forbid IPv4-mapped traffic on an IPv6 socket. Must be
    /// called before bind.
    pub fn set_ipv6_only(&self, only: bool) -> io::Result<()> {
        self.setsockopt(
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            libc::c_int::from(only),
        )
    }

    /// Bind to a local address.
    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from(addr);
        let ret =
            unsafe { libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Start a non-blocking connect. The caller interprets EINPROGRESS,
    /// EALREADY, and EISCONN from the raw OS error.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from(addr);
        let ret =
            unsafe { libc::connect(self.fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Mark a bound stream socket as listening.
    pub fn listen(&self, backlog: libc::c_int) -> io::Result<()> {
        let ret = unsafe { libc::listen(self.fd, backlog) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one pending connection, non-blocking.
    pub fn accept(&self) -> io::Result<(Socket, Option<SocketAddr>)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = Socket {
            fd,
            opened_at: timestamp(),
        };
        Ok((sock, sockaddr_to(&storage, len)))
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to(&storage, len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unknown address family"))
    }

    /// Send one datagram to an explicit destination, without blocking.
    pub fn send_to(&self, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
        let (storage, len) = sockaddr_from(addr);
        let ret = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    /// Send bytes on a connected stream socket, without blocking.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let ret = unsafe {
            libc::send(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    /// Receive bytes from a connected stream socket, without blocking.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let ret = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    /// Receive one datagram with source address and ECN information.
    pub fn recv_msg(&self, buf: &mut [u8]) -> io::Result<Datagram> {
        let mut name: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut control = [0u8; 128];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut header: libc::msghdr = unsafe { mem::zeroed() };
        header.msg_name = &mut name as *mut _ as *mut libc::c_void;
        header.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        header.msg_iov = &mut iov;
        header.msg_iovlen = 1;
        header.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        header.msg_controllen = control.len() as _;

        let ret = unsafe { libc::recvmsg(self.fd, &mut header, libc::MSG_DONTWAIT) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut congestion_experienced = false;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&header);
            while !cmsg.is_null() {
                let level = (*cmsg).cmsg_level;
                let kind = (*cmsg).cmsg_type;
                if (level == libc::IPPROTO_IP && kind == libc::IP_TOS)
                    || (level == libc::IPPROTO_IPV6 && kind == libc::IPV6_TCLASS)
                {
                    let tos = *(libc::CMSG_DATA(cmsg) as *const u8);
                    congestion_experienced = tos & ECN_CE_MASK == ECN_CE_MASK;
                }
                cmsg = libc::CMSG_NXTHDR(&header, cmsg);
            }
        }

        Ok(Datagram {
            len: ret as usize,
            from: sockaddr_to(&name, header.msg_namelen),
            congestion_experienced,
            truncated: header.msg_flags & libc::MSG_TRUNC != 0,
        })
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_to(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
