//! The combined transport: one UDP and one TCP child, with per-send
//! liveness probing and failover.
//!
//! The "active" channel is the one that most recently produced a received
//! Instruction; it answers the address and timing queries. Sends go to the
//! active channel always, and to the other channel whenever its probe
//! predicate says the active one may be dead or the idle one is worth
//! re-testing.

use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;

use crate::core::constants::UDP_PROBE_TIMEOUT_MS;
use crate::core::{Instruction, NetworkResult, PortRange};
use crate::crypto::Base64Key;
use crate::transport::report::ReportFn;
use crate::transport::tcp::TcpTransport;
use crate::transport::timing::timestamp;
use crate::transport::udp::UdpTransport;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    Udp,
    Tcp,
}

/// Supervisor owning both transports, preferring UDP.
pub struct CombinedTransport {
    udp: UdpTransport,
    tcp: TcpTransport,
    active: Active,
    last_udp_recv: u64,
    last_tcp_recv: u64,
    last_udp_send: u64,
}

impl CombinedTransport {
    /// Bind both server transports.
    pub fn server(
        key: &Base64Key,
        desired_ip: Option<IpAddr>,
        udp_ports: PortRange,
        tcp_ports: PortRange,
    ) -> NetworkResult<Self> {
        Ok(CombinedTransport::new(
            UdpTransport::server(key, desired_ip, udp_ports)?,
            TcpTransport::server(key, desired_ip, tcp_ports)?,
        ))
    }

    /// Connect both client transports to the same host.
    pub fn client(
        key: &Base64Key,
        ip: IpAddr,
        udp_port: u16,
        tcp_port: u16,
    ) -> NetworkResult<Self> {
        Ok(CombinedTransport::new(
            UdpTransport::client(key, ip, udp_port)?,
            TcpTransport::client(key, ip, tcp_port)?,
        ))
    }

    fn new(udp: UdpTransport, tcp: TcpTransport) -> Self {
        CombinedTransport {
            udp,
            tcp,
            active: Active::Udp,
            last_udp_recv: 0,
            last_tcp_recv: 0,
            last_udp_send: 0,
        }
    }

    fn using_udp(&self) -> bool {
        self.active == Active::Udp
    }

    /// The idle UDP channel is worth re-testing: TCP has gone quiet past
    /// its own RTO, or we have not tried UDP for the probe interval.
    fn should_probe_udp(&self) -> bool {
        let now = timestamp();
        now.saturating_sub(self.last_tcp_recv) > self.tcp.timeout()
            || now.saturating_sub(self.last_udp_send) >= UDP_PROBE_TIMEOUT_MS
    }

    /// UDP looks dead: nothing received within its RTO. Also true before
    /// anything was ever received, so TCP fallback is immediate when UDP
    /// never worked.
    fn should_probe_tcp(&self) -> bool {
        timestamp().saturating_sub(self.last_udp_recv) > self.udp.timeout()
    }

    fn active_transport(&self) -> &dyn Transport {
        match self.active {
            Active::Udp => &self.udp,
            Active::Tcp => &self.tcp,
        }
    }

    fn active_transport_mut(&mut self) -> &mut dyn Transport {
        match self.active {
            Active::Udp => &mut self.udp,
            Active::Tcp => &mut self.tcp,
        }
    }
}

impl Transport for CombinedTransport {
    fn send(&mut self, inst: &Instruction) -> NetworkResult<()> {
        if self.using_udp() || self.should_probe_udp() {
            self.udp.send(inst)?;
            self.last_udp_send = timestamp();
        }
        if !self.using_udp() || self.should_probe_tcp() {
            self.tcp.send(inst)?;
        }
        Ok(())
    }

    fn recv(&mut self) -> NetworkResult<Option<Instruction>> {
        if let Some(inst) = self.udp.recv()? {
            self.last_udp_recv = timestamp();
            self.active = Active::Udp;
            return Ok(Some(inst));
        }

        let inst = self.tcp.recv()?;
        if inst.is_some() {
            self.last_tcp_recv = timestamp();
            self.active = Active::Tcp;
        }
        Ok(inst)
    }

    fn finish_send(&mut self) -> bool {
        // Only the stream path buffers.
        self.tcp.finish_send()
    }

    fn clear_send_error(&mut self) -> String {
        // The active channel is the one succeeding; its counterpart's
        // error is the interesting one. Both are cleared.
        let tcp_error = self.tcp.clear_send_error();
        let udp_error = self.udp.clear_send_error();
        if self.using_udp() {
            tcp_error
        } else {
            udp_error
        }
    }

    fn fds_notify_read(&self) -> Vec<RawFd> {
        let mut fds = self.udp.fds_notify_read();
        fds.extend(self.tcp.fds_notify_read());
        fds
    }

    fn fds_notify_write(&self) -> Vec<RawFd> {
        // UDP never blocks the send path on writability.
        self.tcp.fds_notify_write()
    }

    fn udp_port(&self) -> Option<u16> {
        self.udp.udp_port()
    }

    fn tcp_port(&self) -> Option<u16> {
        self.tcp.tcp_port()
    }

    fn timeout(&self) -> u64 {
        self.udp.timeout().min(self.tcp.timeout())
    }

    fn srtt(&self) -> f64 {
        self.active_transport().srtt()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.active_transport().remote_addr()
    }

    fn has_remote_addr(&self) -> bool {
        self.active_transport().has_remote_addr()
    }

    fn set_last_roundtrip_success(&mut self, timestamp_ms: u64) {
        self.active_transport_mut()
            .set_last_roundtrip_success(timestamp_ms);
    }

    fn set_report_function(&mut self, report_fn: ReportFn) {
        self.udp.set_report_function(report_fn.clone());
        self.tcp.set_report_function(report_fn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn sample_instruction(tag: u64) -> Instruction {
        Instruction {
            old_num: tag,
            new_num: tag + 1,
            ack_num: tag,
            throwaway_num: 0,
            payload: b"combined".to_vec(),
        }
    }

    fn recv_until(t: &mut CombinedTransport) -> Option<Instruction> {
        for _ in 0..400 {
            if let Some(inst) = t.recv().unwrap() {
                return Some(inst);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_prefers_udp_on_receive() {
        let key = Base64Key::random();
        let mut server = CombinedTransport::server(
            &key,
            Some(localhost()),
            PortRange::single(0),
            PortRange::single(0),
        )
        .unwrap();
        let mut client = CombinedTransport::client(
            &key,
            localhost(),
            server.udp_port().unwrap(),
            server.tcp_port().unwrap(),
        )
        .unwrap();

        client.send(&sample_instruction(0)).unwrap();
        let inst = recv_until(&mut server).expect("nothing received");
        assert_eq!(inst, sample_instruction(0));
        // UDP delivered; it is (still) the trusted channel.
        assert!(server.using_udp());
        assert_eq!(server.remote_addr(), server.udp.remote_addr());
    }

    #[test]
    fn test_falls_back_to_tcp_when_udp_dark() {
        let key = Base64Key::random();
        let mut server = CombinedTransport::server(
            &key,
            Some(localhost()),
            PortRange::single(0),
            PortRange::single(0),
        )
        .unwrap();

        // Point the client's UDP at a dead port; only TCP can get through.
        let dead_udp_port = {
            let probe = UdpTransport::server(&key, Some(localhost()), PortRange::single(0)).unwrap();
            probe.udp_port().unwrap()
        };
        let mut client = CombinedTransport::client(
            &key,
            localhost(),
            dead_udp_port,
            server.tcp_port().unwrap(),
        )
        .unwrap();

        // last_udp_recv starts at zero, so TCP is probed from the start.
        assert!(client.should_probe_tcp());
        std::thread::sleep(Duration::from_millis(20));
        client.send(&sample_instruction(1)).unwrap();

        let inst = recv_until(&mut server).expect("nothing received");
        assert_eq!(inst, sample_instruction(1));
        assert!(!server.using_udp());

        // The reply rides TCP; the client flips active to TCP too and
        // reports TCP's peer address.
        server.send(&sample_instruction(2)).unwrap();
        let reply = recv_until(&mut client).expect("no reply");
        assert_eq!(reply, sample_instruction(2));
        assert!(!client.using_udp());
        let tcp_addr = client.tcp.remote_addr().unwrap();
        assert_eq!(client.remote_addr(), Some(tcp_addr));
    }

    #[test]
    fn test_timeout_is_min_of_children() {
        let key = Base64Key::random();
        let server = CombinedTransport::server(
            &key,
            Some(localhost()),
            PortRange::single(0),
            PortRange::single(0),
        )
        .unwrap();
        assert_eq!(
            server.timeout(),
            server.udp.timeout().min(server.tcp.timeout())
        );
    }

    #[test]
    fn test_read_fds_union_write_fds_tcp_only() {
        let key = Base64Key::random();
        let server = CombinedTransport::server(
            &key,
            Some(localhost()),
            PortRange::single(0),
            PortRange::single(0),
        )
        .unwrap();

        let read_fds = server.fds_notify_read();
        assert!(read_fds.len() >= 2);
        // No buffered TCP bytes, so nothing needs write readiness.
        assert!(server.fds_notify_write().is_empty());
    }

    #[test]
    fn test_both_ports_exposed() {
        let key = Base64Key::random();
        let server = CombinedTransport::server(
            &key,
            Some(localhost()),
            PortRange::single(0),
            PortRange::single(0),
        )
        .unwrap();
        assert!(server.udp_port().is_some());
        assert!(server.tcp_port().is_some());
    }
}
