//! The datagram transport: a pool of non-blocking UDP sockets with port
//! hopping, server-side client roaming, ECN feedback, and MTU management.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;

use crate::core::constants::{
    DEFAULT_SEND_MTU, DEFAULT_IPV4_MTU, DEFAULT_IPV6_MTU, IPV4_HEADER_LEN, IPV6_HEADER_LEN,
    MAX_OLD_SOCKET_AGE_MS, MAX_PORTS_OPEN, PACKET_ADDED_BYTES, PORT_HOP_INTERVAL_MS, RECEIVE_MTU,
    SERVER_ASSOCIATION_TIMEOUT_MS, SESSION_ADDED_BYTES, TIMESTAMP_NONE,
};
use crate::core::{Instruction, NetworkError, NetworkResult, PortRange};
use crate::crypto::{Base64Key, Direction, Session};
use crate::transport::fragment::{Fragment, FragmentAssembly, Fragmenter};
use crate::transport::packet::Packet;
use crate::transport::report::{Report, ReportFn};
use crate::transport::socket::Socket;
use crate::transport::timing::{timestamp, timestamp16, timestamp_diff, RttEstimator, SavedTimestamp};
use crate::transport::{compress, Transport};

/// The datagram transport.
///
/// A server binds a port from its range and waits; it has no peer address
/// until the first authenticated packet arrives, and adopts a new source
/// address whenever an authenticated packet brings one (client roaming).
/// A client knows its peer from construction and periodically opens a
/// fresh socket on a new local port so NAT idle timeouts never strand the
/// session.
pub struct UdpTransport {
    socks: VecDeque<Socket>,
    has_remote_addr: bool,
    remote_addr: Option<SocketAddr>,
    server: bool,
    mtu: usize,

    session: Session,
    direction: Direction,
    saved_timestamp: SavedTimestamp,
    expected_receiver_seq: u64,

    last_heard: u64,
    last_port_choice: u64,
    last_roundtrip_success: u64,

    rtt: RttEstimator,
    send_error: String,
    last_ack_sent: u64,

    fragmenter: Fragmenter,
    fragments: FragmentAssembly,
    report_fn: Option<ReportFn>,
}

impl UdpTransport {
    fn new(key: &Base64Key, server: bool) -> Self {
        UdpTransport {
            socks: VecDeque::new(),
            has_remote_addr: false,
            remote_addr: None,
            server,
            mtu: DEFAULT_SEND_MTU,
            session: Session::new(key),
            direction: if server {
                Direction::ToClient
            } else {
                Direction::ToServer
            },
            saved_timestamp: SavedTimestamp::new(),
            expected_receiver_seq: 0,
            last_heard: 0,
            last_port_choice: timestamp(),
            last_roundtrip_success: 0,
            rtt: RttEstimator::new(),
            send_error: String::new(),
            last_ack_sent: 0,
            fragmenter: Fragmenter::new(),
            fragments: FragmentAssembly::new(),
            report_fn: None,
        }
    }

    /// Bind a server transport.
    ///
    /// Tries the desired IP across the port range first, then falls back
    /// to the wildcard address of the same family.
    pub fn server(
        key: &Base64Key,
        desired_ip: Option<IpAddr>,
        desired_port: PortRange,
    ) -> NetworkResult<Self> {
        let mut transport = UdpTransport::new(key, true);

        if let Some(ip) = desired_ip {
            match transport.try_bind(ip, desired_port) {
                Ok(()) => return Ok(transport),
                Err(e) => {
                    tracing::warn!(%ip, error = %e, "binding to requested address failed, trying wildcard");
                }
            }
        }

        let wildcard = match desired_ip {
            Some(IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        transport.try_bind(wildcard, desired_port)?;
        Ok(transport)
    }

    /// Connect a client transport to `(ip, port)`.
    ///
    /// The address is used verbatim; no name resolution happens here.
    pub fn client(key: &Base64Key, ip: IpAddr, port: u16) -> NetworkResult<Self> {
        let mut transport = UdpTransport::new(key, false);

        transport.remote_addr = Some(SocketAddr::new(ip, port));
        transport.has_remote_addr = true;
        transport
            .add_socket(ip.is_ipv6())
            .map_err(|e| NetworkError::FatalIo {
                context: "socket",
                source: e,
            })?;
        transport.set_mtu(ip.is_ipv6());
        Ok(transport)
    }

    fn try_bind(&mut self, ip: IpAddr, ports: PortRange) -> NetworkResult<()> {
        let sock = Self::open_socket(ip.is_ipv6()).map_err(|e| NetworkError::FatalIo {
            context: "socket",
            source: e,
        })?;

        // A wildcard v6 bind should accept v4 peers too.
        if ip == IpAddr::V6(Ipv6Addr::UNSPECIFIED) {
            if let Err(e) = sock.set_ipv6_only(false) {
                tracing::warn!(error = %e, "could not clear IPV6_V6ONLY");
            }
        }

        let mut last_err = None;
        for port in ports.low..=ports.high {
            match sock.bind(&SocketAddr::new(ip, port)) {
                Ok(()) => {
                    self.socks.push_back(sock);
                    self.set_mtu(ip.is_ipv6());
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(%ip, port, error = %e, "bind failed");
                    last_err = Some(e);
                }
            }
        }

        Err(NetworkError::BindFailure {
            addr: ip.to_string(),
            low: ports.low,
            high: ports.high,
            source: last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "empty port range")),
        })
    }

    fn open_socket(v6: bool) -> io::Result<Socket> {
        let sock = Socket::udp(v6)?;
        sock.disable_path_mtu_discovery()?;
        sock.set_ecn_capable(v6);
        sock.request_ecn(v6);
        Ok(sock)
    }

    fn add_socket(&mut self, v6: bool) -> io::Result<()> {
        let sock = Self::open_socket(v6)?;
        self.socks.push_back(sock);
        Ok(())
    }

    fn set_mtu(&mut self, v6: bool) {
        self.mtu = if v6 {
            DEFAULT_IPV6_MTU - IPV6_HEADER_LEN
        } else {
            DEFAULT_IPV4_MTU - IPV4_HEADER_LEN
        };
    }

    fn hop_port(&mut self) -> NetworkResult<()> {
        debug_assert!(!self.server);
        self.last_port_choice = timestamp();

        let v6 = matches!(self.remote_addr, Some(SocketAddr::V6(_)));
        self.add_socket(v6).map_err(|e| NetworkError::FatalIo {
            context: "socket",
            source: e,
        })?;
        self.prune_sockets();
        Ok(())
    }

    fn prune_sockets(&mut self) {
        // Old sockets stay open only while no newer one exists.
        let now = timestamp();
        while self.socks.len() > 1 {
            match self.socks.front() {
                Some(front) if now.saturating_sub(front.opened_at()) > MAX_OLD_SOCKET_AGE_MS => {
                    self.socks.pop_front();
                }
                _ => break,
            }
        }
        while self.socks.len() > MAX_PORTS_OPEN {
            self.socks.pop_front();
        }
    }

    fn new_packet(&mut self, payload: Vec<u8>) -> NetworkResult<Packet> {
        Ok(Packet::new(
            self.session.unique()?,
            self.direction,
            timestamp16(),
            self.saved_timestamp.take_reply(),
            payload,
        ))
    }

    fn send_fragment(&mut self, contents: &[u8]) -> NetworkResult<()> {
        let packet = self.new_packet(contents.to_vec())?;
        let wire = self.session.encrypt(&packet.to_message())?;

        let (Some(remote), Some(sock)) = (self.remote_addr, self.socks.back()) else {
            return Ok(());
        };
        match sock.send_to(&wire, &remote) {
            Ok(n) if n == wire.len() => {}
            Ok(n) => {
                self.send_error = format!("sendto: short write ({n} of {} bytes)", wire.len());
            }
            Err(e) => {
                self.send_error = format!("sendto: {e}");
                if e.raw_os_error() == Some(libc::EMSGSIZE) {
                    self.mtu = DEFAULT_SEND_MTU;
                }
            }
        }

        let now = timestamp();
        if self.server {
            if now.saturating_sub(self.last_heard) > SERVER_ASSOCIATION_TIMEOUT_MS {
                self.has_remote_addr = false;
                tracing::info!("server now detached from client");
            }
        } else if now.saturating_sub(self.last_port_choice) > PORT_HOP_INTERVAL_MS
            && now.saturating_sub(self.last_roundtrip_success) > PORT_HOP_INTERVAL_MS
        {
            self.hop_port()?;
        }

        Ok(())
    }

    /// Receive one datagram from one socket and run it through the packet
    /// state machine. `Ok(None)` means this socket yielded nothing usable:
    /// not ready, or the datagram was rejected.
    fn recv_one(&mut self, index: usize) -> NetworkResult<Option<Vec<u8>>> {
        let mut buf = [0u8; RECEIVE_MTU];
        let dgram = match self.socks[index].recv_msg(&mut buf) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => {
                return Err(NetworkError::FatalIo {
                    context: "recvmsg",
                    source: e,
                })
            }
        };

        if dgram.truncated {
            tracing::debug!(len = dgram.len, "dropping oversize datagram");
            return Ok(None);
        }

        let message = match self.session.decrypt(&buf[..dgram.len]) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "dropping undecryptable datagram");
                return Ok(None);
            }
        };
        let packet = match Packet::from_message(message) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed packet");
                return Ok(None);
            }
        };

        // Reject traffic reflected back at its sender.
        let expected_direction = if self.server {
            Direction::ToServer
        } else {
            Direction::ToClient
        };
        if packet.direction != expected_direction {
            tracing::debug!("dropping packet with wrong direction bit");
            return Ok(None);
        }

        if packet.seq < self.expected_receiver_seq {
            // Out-of-order: return the payload, but an old packet must not
            // update timing or targeting state.
            return Ok(Some(packet.payload));
        }
        self.expected_receiver_seq = packet.seq + 1;

        if packet.timestamp != TIMESTAMP_NONE {
            self.saved_timestamp.record(packet.timestamp);

            if dgram.congestion_experienced {
                // Signal the counterparty to slow down; over time this
                // walks its frame rate down to the minimum.
                self.saved_timestamp.penalize();
                if self.server {
                    tracing::info!("received explicit congestion notification");
                }
            }
        }

        if packet.timestamp_reply != TIMESTAMP_NONE {
            let sample = timestamp_diff(timestamp16(), packet.timestamp_reply);
            self.rtt.observe(f64::from(sample));
        }

        self.has_remote_addr = true;
        self.last_heard = timestamp();

        // Only the client can roam.
        if self.server {
            if let Some(from) = dgram.from {
                if self.remote_addr != Some(from) {
                    self.remote_addr = Some(from);
                    tracing::info!(peer = %from, "server now attached to client");
                }
            }
        }

        Ok(Some(packet.payload))
    }

    fn recv_fragment(&mut self) -> NetworkResult<Option<Vec<u8>>> {
        // Newest socket first; it is the one the peer most likely targets.
        for index in (0..self.socks.len()).rev() {
            if let Some(payload) = self.recv_one(index)? {
                self.prune_sockets();
                return Ok(Some(payload));
            }
        }
        Ok(None)
    }

    fn report(&self, report: Report) {
        if let Some(report_fn) = self.report_fn.as_deref() {
            report_fn(&report);
        }
    }

    /// Acknowledgement number of the most recently sent Instruction.
    pub fn last_ack_sent(&self) -> u64 {
        self.last_ack_sent
    }

    #[cfg(test)]
    pub(crate) fn expected_receiver_seq(&self) -> u64 {
        self.expected_receiver_seq
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, inst: &Instruction) -> NetworkResult<()> {
        self.last_ack_sent = inst.ack_num;
        if !self.has_remote_addr {
            return Ok(());
        }

        let fragment_size = self
            .mtu
            .saturating_sub(PACKET_ADDED_BYTES + SESSION_ADDED_BYTES);
        let fragments = self.fragmenter.make_fragments(inst, fragment_size)?;
        for fragment in fragments {
            self.send_fragment(&fragment.to_bytes())?;
            self.report(Report::UdpSend {
                inst: inst.clone(),
                fragment,
                timeout: self.rtt.rto(),
                srtt: self.rtt.srtt(),
            });
        }
        Ok(())
    }

    fn recv(&mut self) -> NetworkResult<Option<Instruction>> {
        let Some(payload) = self.recv_fragment()? else {
            return Ok(None);
        };

        let frag = match Fragment::from_bytes(&payload) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed fragment");
                return Ok(None);
            }
        };

        let Some(assembled) = self.fragments.add_fragment(frag) else {
            return Ok(None);
        };
        let body = match compress::decompress(&assembled) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(error = %e, "dropping undecompressable assembly");
                return Ok(None);
            }
        };
        let inst = match Instruction::parse(&body) {
            Ok(i) => i,
            Err(e) => {
                tracing::debug!(error = %e, "dropping unparseable instruction");
                return Ok(None);
            }
        };

        self.report(Report::UdpRecv { inst: inst.clone() });
        Ok(Some(inst))
    }

    fn finish_send(&mut self) -> bool {
        // Datagram sends never buffer.
        true
    }

    fn clear_send_error(&mut self) -> String {
        std::mem::take(&mut self.send_error)
    }

    fn fds_notify_read(&self) -> Vec<RawFd> {
        self.socks.iter().map(Socket::fd).collect()
    }

    fn fds_notify_write(&self) -> Vec<RawFd> {
        Vec::new()
    }

    fn udp_port(&self) -> Option<u16> {
        let sock = self.socks.back()?;
        sock.local_addr().ok().map(|addr| addr.port())
    }

    fn tcp_port(&self) -> Option<u16> {
        None
    }

    fn timeout(&self) -> u64 {
        self.rtt.rto()
    }

    fn srtt(&self) -> f64 {
        self.rtt.srtt()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.has_remote_addr.then_some(self.remote_addr).flatten()
    }

    fn has_remote_addr(&self) -> bool {
        self.has_remote_addr
    }

    fn set_last_roundtrip_success(&mut self, timestamp_ms: u64) {
        self.last_roundtrip_success = timestamp_ms;
    }

    fn set_report_function(&mut self, report_fn: ReportFn) {
        self.report_fn = Some(report_fn);
    }
}
