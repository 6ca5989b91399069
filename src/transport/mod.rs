//! Transport layer: UDP datagram, TCP stream, and the combined supervisor
//! that fails over between them.
//!
//! - **Wire handling**: [`Packet`] conversion, [`Fragment`] split/reassembly,
//!   length framing on the stream path
//! - **Timing**: [`RttEstimator`] and the 16-bit timestamp-echo scheme
//! - **Sockets**: a non-blocking pool with port hopping and ECN reception
//! - **Supervision**: [`CombinedTransport`] probing and switching channels
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Session layer (caller)          │
//! ├─────────────────────────────────────────┤
//! │          Transport trait                │  ← this module
//! │   UdpTransport  TcpTransport  Combined  │
//! ├─────────────────────────────────────────┤
//! │         Authenticated session           │
//! ├─────────────────────────────────────────┤
//! │        non-blocking UDP / TCP           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Nothing here blocks: the caller owns the event loop, multiplexing over
//! [`Transport::fds_notify_read`] / [`Transport::fds_notify_write`] with
//! [`Transport::timeout`] as the wake deadline, and invokes `recv`,
//! `finish_send`, or `send` when a descriptor is ready.

mod combined;
mod compress;
mod fragment;
mod packet;
mod report;
mod socket;
mod tcp;
mod timing;
mod udp;

pub use combined::CombinedTransport;
pub use compress::CompressionError;
pub use fragment::{Fragment, FragmentAssembly, Fragmenter};
pub use packet::Packet;
pub use report::{Report, ReportFn};
pub use tcp::TcpTransport;
pub use timing::{timestamp, timestamp16, timestamp_diff, RttEstimator};
pub use udp::UdpTransport;

use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;

use crate::core::{Instruction, NetworkResult, PortRange, TransportMode};
use crate::crypto::Base64Key;

/// The polymorphic contract every concrete transport implements.
///
/// All operations are non-blocking. Transient socket conditions surface as
/// "nothing to do" (`Ok(None)`, `false`); non-fatal send failures are
/// retrievable as a string via [`Transport::clear_send_error`]; only
/// unrecoverable conditions return `Err`.
pub trait Transport {
    /// Best-effort emit of one Instruction. The stream path may buffer a
    /// partial write or drop the Instruction (reported via the observer);
    /// the datagram path fragments and sends immediately.
    fn send(&mut self, inst: &Instruction) -> NetworkResult<()>;

    /// Return at most one fully assembled Instruction, without blocking.
    fn recv(&mut self) -> NetworkResult<Option<Instruction>>;

    /// Drain buffered outbound bytes. Returns true once the buffer is empty.
    fn finish_send(&mut self) -> bool;

    /// Return and clear the last non-fatal I/O error message.
    fn clear_send_error(&mut self) -> String;

    /// File descriptors the caller should select for readability.
    fn fds_notify_read(&self) -> Vec<RawFd>;

    /// File descriptors the caller should select for writability.
    fn fds_notify_write(&self) -> Vec<RawFd>;

    /// Local bound UDP port, if this transport has one.
    fn udp_port(&self) -> Option<u16>;

    /// Local bound TCP port, if this transport has one.
    fn tcp_port(&self) -> Option<u16>;

    /// Current retransmission timeout in milliseconds.
    fn timeout(&self) -> u64;

    /// Current smoothed round-trip time in milliseconds.
    fn srtt(&self) -> f64;

    /// Current peer address, if one is known.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Whether a peer address is currently known.
    fn has_remote_addr(&self) -> bool;

    /// Inform the transport that a round trip completed at the given
    /// millisecond timestamp, inhibiting port hopping.
    fn set_last_roundtrip_success(&mut self, timestamp_ms: u64);

    /// Install an observer for send and receive events.
    fn set_report_function(&mut self, report_fn: ReportFn);
}

/// Instantiate the server-side transport for a mode.
///
/// `desired_ip` of `None` binds the wildcard address.
pub fn server_transport(
    mode: TransportMode,
    key: &Base64Key,
    desired_ip: Option<IpAddr>,
    udp_ports: PortRange,
    tcp_ports: PortRange,
) -> NetworkResult<Box<dyn Transport>> {
    Ok(match mode {
        TransportMode::UdpOnly => Box::new(UdpTransport::server(key, desired_ip, udp_ports)?),
        TransportMode::TcpOnly => Box::new(TcpTransport::server(key, desired_ip, tcp_ports)?),
        TransportMode::PreferUdp => Box::new(CombinedTransport::server(
            key, desired_ip, udp_ports, tcp_ports,
        )?),
    })
}

/// Instantiate the client-side transport for a mode.
pub fn client_transport(
    mode: TransportMode,
    key: &Base64Key,
    ip: IpAddr,
    udp_port: u16,
    tcp_port: u16,
) -> NetworkResult<Box<dyn Transport>> {
    Ok(match mode {
        TransportMode::UdpOnly => Box::new(UdpTransport::client(key, ip, udp_port)?),
        TransportMode::TcpOnly => Box::new(TcpTransport::client(key, ip, tcp_port)?),
        TransportMode::PreferUdp => {
            Box::new(CombinedTransport::client(key, ip, udp_port, tcp_port)?)
        }
    })
}
