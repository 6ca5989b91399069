//! The stream transport: one length-framed TCP connection, used when UDP
//! cannot get through.
//!
//! Each Instruction becomes one frame: `BE32 length | ciphertext`. Sends
//! never block; a partial write parks the remainder in a one-slot buffer
//! that the caller drains via `finish_send` when the socket turns
//! writable. The receive side resumes mid-frame across calls.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;

use crate::core::constants::{TCP_LISTEN_BACKLOG, TIMESTAMP_NONE};
use crate::core::{Instruction, NetworkError, NetworkResult, PortRange};
use crate::crypto::{Base64Key, Direction, Session};
use crate::transport::packet::Packet;
use crate::transport::report::{Report, ReportFn};
use crate::transport::socket::Socket;
use crate::transport::timing::{timestamp16, timestamp_diff, RttEstimator, SavedTimestamp};
use crate::transport::{compress, Transport};

const FRAME_PREFIX_LEN: usize = 4;

/// The stream transport.
///
/// A server keeps its listening socket for the life of the transport and
/// accepts a fresh client after every disconnect. A client reconnects by
/// opening a new socket the next time `send` or `recv` runs.
pub struct TcpTransport {
    server_socket: Option<Socket>,
    sock: Option<Socket>,
    connection_established: bool,
    remote_addr: Option<SocketAddr>,

    session: Session,
    direction: Direction,
    saved_timestamp: SavedTimestamp,
    expected_receiver_seq: u64,

    rtt: RttEstimator,

    rcv_current_packet_len: usize,
    rcv_index: usize,
    rcv_buf: Vec<u8>,

    send_buffer: Vec<u8>,
    send_buffer_index: usize,

    send_error: String,
    last_ack_sent: u64,
    report_fn: Option<ReportFn>,
}

impl TcpTransport {
    fn new(key: &Base64Key, server: bool) -> Self {
        TcpTransport {
            server_socket: None,
            sock: None,
            connection_established: false,
            remote_addr: None,
            session: Session::new(key),
            direction: if server {
                Direction::ToClient
            } else {
                Direction::ToServer
            },
            saved_timestamp: SavedTimestamp::new(),
            expected_receiver_seq: 0,
            rtt: RttEstimator::new(),
            rcv_current_packet_len: 0,
            rcv_index: 0,
            rcv_buf: Vec::new(),
            send_buffer: Vec::new(),
            send_buffer_index: 0,
            send_error: String::new(),
            last_ack_sent: 0,
            report_fn: None,
        }
    }

    /// Bind and listen on the first available port in the range.
    pub fn server(
        key: &Base64Key,
        desired_ip: Option<IpAddr>,
        desired_port: PortRange,
    ) -> NetworkResult<Self> {
        let ip = desired_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let mut transport = TcpTransport::new(key, true);

        let listener = Socket::tcp(ip.is_ipv6()).map_err(|e| NetworkError::FatalIo {
            context: "socket",
            source: e,
        })?;
        if ip == IpAddr::V6(Ipv6Addr::UNSPECIFIED) {
            if let Err(e) = listener.set_ipv6_only(false) {
                tracing::warn!(error = %e, "could not clear IPV6_V6ONLY");
            }
        }

        let mut last_err = None;
        let mut bound = false;
        for port in desired_port.low..=desired_port.high {
            match listener.bind(&SocketAddr::new(ip, port)) {
                Ok(()) => {
                    bound = true;
                    break;
                }
                Err(e) => {
                    tracing::debug!(%ip, port, error = %e, "bind failed");
                    last_err = Some(e);
                }
            }
        }
        if !bound {
            return Err(NetworkError::BindFailure {
                addr: ip.to_string(),
                low: desired_port.low,
                high: desired_port.high,
                source: last_err
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "empty port range")),
            });
        }

        listener
            .listen(TCP_LISTEN_BACKLOG)
            .map_err(|e| NetworkError::FatalIo {
                context: "listen",
                source: e,
            })?;

        transport.server_socket = Some(listener);
        Ok(transport)
    }

    /// Create a client transport and start connecting to `(ip, port)`.
    pub fn client(key: &Base64Key, ip: IpAddr, port: u16) -> NetworkResult<Self> {
        let mut transport = TcpTransport::new(key, false);
        transport.remote_addr = Some(SocketAddr::new(ip, port));
        transport.establish_connection();
        Ok(transport)
    }

    fn is_server(&self) -> bool {
        self.server_socket.is_some()
    }

    fn set_connection_established(&mut self, established: bool) {
        if self.connection_established && !established {
            // Drop any partial frame and buffered send; neither can be
            // resumed on a different connection.
            self.rcv_current_packet_len = 0;
            self.rcv_index = 0;
            self.rcv_buf.clear();
            self.send_buffer.clear();
            self.send_buffer_index = 0;
            self.sock = None;
        }
        self.connection_established = established;
    }

    fn establish_connection(&mut self) -> bool {
        if self.connection_established {
            return true;
        }

        if self.is_server() {
            let Some(listener) = self.server_socket.as_ref() else {
                return false;
            };
            match listener.accept() {
                Ok((sock, from)) => {
                    self.sock = Some(sock);
                    if from.is_some() {
                        self.remote_addr = from;
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        self.send_error = format!("TCP accept: {e}");
                    }
                    return false;
                }
            }
        } else {
            let Some(remote) = self.remote_addr else {
                return false;
            };
            if self.sock.is_none() {
                match Socket::tcp(remote.is_ipv6()) {
                    Ok(sock) => self.sock = Some(sock),
                    Err(e) => {
                        self.send_error = format!("TCP socket: {e}");
                        return false;
                    }
                }
            }
            let Some(sock) = self.sock.as_ref() else {
                return false;
            };
            if let Err(e) = sock.connect(&remote) {
                match e.raw_os_error() {
                    Some(libc::EINPROGRESS) | Some(libc::EALREADY) => return false,
                    Some(libc::EISCONN) => {}
                    _ => {
                        self.set_connection_established(false);
                        self.send_error = format!("TCP connect: {e}");
                        return false;
                    }
                }
            }
        }

        self.set_connection_established(true);
        true
    }

    /// One non-blocking write. `None` means nothing was accepted: the
    /// socket is full, or it failed and the connection was torn down.
    fn send_bytes(&mut self, msg: &[u8], index: usize) -> Option<usize> {
        let sock = self.sock.as_ref()?;
        match sock.send(&msg[index..]) {
            Ok(n) => Some(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                self.set_connection_established(false);
                self.send_error = format!("TCP send: {e}");
                None
            }
        }
    }

    fn send_dropped(&mut self, inst: &Instruction) {
        self.report(Report::SendDropped {
            inst: inst.clone(),
            timeout: self.rtt.rto(),
            srtt: self.rtt.srtt(),
        });
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

    /// Read exactly `size` bytes into the receive buffer, resuming where
    /// the previous call left off. True once the buffer is full.
    fn fill_rcv_buf(&mut self, size: usize) -> NetworkResult<bool> {
        if self.rcv_buf.len() != size {
            self.rcv_buf.resize(size, 0);
        }

        while self.rcv_index < size {
            let result = match self.sock.as_ref() {
                Some(sock) => sock.recv(&mut self.rcv_buf[self.rcv_index..size]),
                None => return Ok(false),
            };
            match result {
                Ok(0) => {
                    // Orderly shutdown from the peer.
                    self.set_connection_established(false);
                    return Ok(false);
                }
                Ok(n) => self.rcv_index += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e)
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::ETIMEDOUT) | Some(libc::ECONNRESET)
                    ) =>
                {
                    self.set_connection_established(false);
                    return Ok(false);
                }
                Err(e) => {
                    self.set_connection_established(false);
                    return Err(NetworkError::FatalIo {
                        context: "recv",
                        source: e,
                    });
                }
            }
        }

        self.rcv_index = 0;
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn expected_receiver_seq(&self) -> u64 {
        self.expected_receiver_seq
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, inst: &Instruction) -> NetworkResult<()> {
        self.last_ack_sent = inst.ack_num;

        if !self.establish_connection() {
            self.send_dropped(inst);
            return Ok(());
        }
        if !self.finish_send() {
            self.send_dropped(inst);
            return Ok(());
        }

        let body = compress::compress(&inst.serialize())?;
        let packet = Packet::new(
            self.session.unique()?,
            self.direction,
            timestamp16(),
            self.saved_timestamp.take_reply(),
            body,
        );
        let msg = self.session.encrypt(&packet.to_message())?;
        debug_assert!(!msg.is_empty() && msg.len() <= u32::MAX as usize);

        let mut framed = Vec::with_capacity(FRAME_PREFIX_LEN + msg.len());
        framed.extend_from_slice(&(msg.len() as u32).to_be_bytes());
        framed.extend_from_slice(&msg);

        match self.send_bytes(&framed, 0) {
            None => self.send_dropped(inst),
            Some(sent) if sent < framed.len() => {
                // Partial write; the caller drains via finish_send.
                self.send_buffer_index = sent;
                self.send_buffer = framed;
            }
            Some(sent) => {
                self.report(Report::TcpSend {
                    inst: inst.clone(),
                    sent_len: sent as u32,
                    msg_len: framed.len() as u32,
                    timeout: self.rtt.rto(),
                    srtt: self.rtt.srtt(),
                });
            }
        }
        Ok(())
    }

    fn recv(&mut self) -> NetworkResult<Option<Instruction>> {
        if !self.establish_connection() {
            return Ok(None);
        }

        if self.rcv_current_packet_len == 0 {
            if !self.fill_rcv_buf(FRAME_PREFIX_LEN)? {
                return Ok(None);
            }
            let len = u32::from_be_bytes(self.rcv_buf[..FRAME_PREFIX_LEN].try_into().unwrap());
            if len == 0 {
                // The framing state machine cannot resynchronize past this.
                tracing::debug!("zero-length frame; dropping connection");
                self.set_connection_established(false);
                return Ok(None);
            }
            self.rcv_current_packet_len = len as usize;
        }

        if !self.fill_rcv_buf(self.rcv_current_packet_len)? {
            return Ok(None);
        }
        let frame_len = std::mem::replace(&mut self.rcv_current_packet_len, 0);

        let message = match self.session.decrypt(&self.rcv_buf[..frame_len]) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "dropping undecryptable frame");
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
        let expected_direction = if self.is_server() {
            Direction::ToServer
        } else {
            Direction::ToClient
        };
        if packet.direction != expected_direction {
            tracing::debug!("dropping packet with wrong direction bit");
            return Ok(None);
        }

        // The stream is ordered, so a sequence from the past is a protocol
        // violation, not reordering.
        if packet.seq < self.expected_receiver_seq {
            tracing::debug!(seq = packet.seq, "dropping out-of-order stream packet");
            return Ok(None);
        }
        self.expected_receiver_seq = packet.seq + 1;

        if packet.timestamp != TIMESTAMP_NONE {
            self.saved_timestamp.record(packet.timestamp);
        }
        if packet.timestamp_reply != TIMESTAMP_NONE {
            let sample = timestamp_diff(timestamp16(), packet.timestamp_reply);
            self.rtt.observe(f64::from(sample));
        }

        let body = match compress::decompress(&packet.payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(error = %e, "dropping undecompressable frame");
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

        self.report(Report::TcpRecv { inst: inst.clone() });
        Ok(Some(inst))
    }

    fn finish_send(&mut self) -> bool {
        if self.send_buffer.is_empty() {
            return true;
        }

        let buffer = std::mem::take(&mut self.send_buffer);
        let sent = self.send_bytes(&buffer, self.send_buffer_index);
        if self.connection_established {
            self.send_buffer = buffer;
        }
        let Some(sent) = sent else {
            return false;
        };

        self.send_buffer_index += sent;
        if self.send_buffer_index >= self.send_buffer.len() {
            self.send_buffer.clear();
            self.send_buffer_index = 0;
            return true;
        }
        false
    }

    fn clear_send_error(&mut self) -> String {
        std::mem::take(&mut self.send_error)
    }

    fn fds_notify_read(&self) -> Vec<RawFd> {
        let mut fds = Vec::new();
        if let Some(listener) = &self.server_socket {
            fds.push(listener.fd());
        }
        if let Some(sock) = &self.sock {
            fds.push(sock.fd());
        }
        fds
    }

    fn fds_notify_write(&self) -> Vec<RawFd> {
        match &self.sock {
            Some(sock) if !self.send_buffer.is_empty() => vec![sock.fd()],
            _ => Vec::new(),
        }
    }

    fn udp_port(&self) -> Option<u16> {
        None
    }

    fn tcp_port(&self) -> Option<u16> {
        let sock = self.server_socket.as_ref().or(self.sock.as_ref())?;
        sock.local_addr().ok().map(|addr| addr.port())
    }

    fn timeout(&self) -> u64 {
        self.rtt.rto()
    }

    fn srtt(&self) -> f64 {
        self.rtt.srtt()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection_established
            .then_some(self.remote_addr)
            .flatten()
    }

    fn has_remote_addr(&self) -> bool {
        self.connection_established
    }

    fn set_last_roundtrip_success(&mut self, _timestamp_ms: u64) {
        // The stream path never hops ports.
    }

    fn set_report_function(&mut self, report_fn: ReportFn) {
        self.report_fn = Some(report_fn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn pair() -> (TcpTransport, TcpTransport) {
        let key = Base64Key::random();
        let server = TcpTransport::server(&key, Some(localhost()), PortRange::single(0)).unwrap();
        let port = server.tcp_port().unwrap();
        let client = TcpTransport::client(&key, localhost(), port).unwrap();
        (server, client)
    }

    fn recv_until(t: &mut TcpTransport) -> Option<Instruction> {
        for _ in 0..400 {
            if let Some(inst) = t.recv().unwrap() {
                return Some(inst);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    fn sample_instruction(tag: u64) -> Instruction {
        Instruction {
            old_num: tag,
            new_num: tag + 1,
            ack_num: tag,
            throwaway_num: 0,
            payload: format!("instruction {tag}").into_bytes(),
        }
    }

    #[test]
    fn test_framed_roundtrip_in_order() {
        let (mut server, mut client) = pair();

        // Give the non-blocking connect a beat to complete.
        std::thread::sleep(Duration::from_millis(20));
        for tag in 0..3 {
            client.send(&sample_instruction(tag)).unwrap();
        }

        for tag in 0..3 {
            let inst = recv_until(&mut server).expect("missing instruction");
            assert_eq!(inst, sample_instruction(tag));
        }
        assert_eq!(server.expected_receiver_seq(), 3);
    }

    #[test]
    fn test_chunked_delivery_reassembles() {
        // Frames dribbled to the receiver 7 bytes at a time must come out
        // whole and in order.
        let key = Base64Key::random();
        let mut server = TcpTransport::server(&key, Some(localhost()), PortRange::single(0)).unwrap();
        let port = server.tcp_port().unwrap();

        let mut sender = Session::new(&key);
        let mut stream = TcpStream::connect((localhost(), port)).unwrap();

        let mut wire = Vec::new();
        for tag in 0..3 {
            let inst = sample_instruction(tag);
            let body = compress::compress(&inst.serialize()).unwrap();
            let packet = Packet::new(
                sender.unique().unwrap(),
                Direction::ToServer,
                timestamp16(),
                TIMESTAMP_NONE,
                body,
            );
            let msg = sender.encrypt(&packet.to_message()).unwrap();
            wire.extend_from_slice(&(msg.len() as u32).to_be_bytes());
            wire.extend_from_slice(&msg);
        }

        for chunk in wire.chunks(7) {
            stream.write_all(chunk).unwrap();
            stream.flush().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }

        for tag in 0..3 {
            let inst = recv_until(&mut server).expect("missing instruction");
            assert_eq!(inst, sample_instruction(tag));
        }
    }

    #[test]
    fn test_send_before_accept_drops() {
        let key = Base64Key::random();
        let port = {
            // Bind and immediately free a port so nothing listens on it.
            let probe = TcpTransport::server(&key, Some(localhost()), PortRange::single(0)).unwrap();
            probe.tcp_port().unwrap()
        };

        let drops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&drops);

        let mut client = TcpTransport::client(&key, localhost(), port).unwrap();
        client.set_report_function(Arc::new(move |report| {
            if matches!(report, Report::SendDropped { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        // Connection refused surfaces while connecting; the instruction
        // is dropped rather than buffered.
        for _ in 0..10 {
            client.send(&sample_instruction(9)).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(drops.load(Ordering::SeqCst) > 0);
        assert!(!client.has_remote_addr());
    }

    #[test]
    fn test_zero_length_frame_drops_connection() {
        let key = Base64Key::random();
        let mut server = TcpTransport::server(&key, Some(localhost()), PortRange::single(0)).unwrap();
        let port = server.tcp_port().unwrap();

        let mut stream = TcpStream::connect((localhost(), port)).unwrap();
        stream.write_all(&0u32.to_be_bytes()).unwrap();
        stream.flush().unwrap();

        for _ in 0..100 {
            assert!(server.recv().unwrap().is_none());
            if !server.connection_established && server.sock.is_none() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("connection was not dropped");
    }

    #[test]
    fn test_stale_seq_dropped_on_stream() {
        let key = Base64Key::random();
        let mut server = TcpTransport::server(&key, Some(localhost()), PortRange::single(0)).unwrap();
        let port = server.tcp_port().unwrap();

        let sender = Session::new(&key);
        let mut stream = TcpStream::connect((localhost(), port)).unwrap();

        let frame_with_seq = |seq: u64, tag: u64| {
            let body = compress::compress(&sample_instruction(tag).serialize()).unwrap();
            let packet = Packet::new(seq, Direction::ToServer, 100, TIMESTAMP_NONE, body);
            let msg = sender.encrypt(&packet.to_message()).unwrap();
            let mut framed = (msg.len() as u32).to_be_bytes().to_vec();
            framed.extend_from_slice(&msg);
            framed
        };

        stream.write_all(&frame_with_seq(5, 0)).unwrap();
        stream.write_all(&frame_with_seq(3, 1)).unwrap();
        stream.flush().unwrap();

        assert_eq!(recv_until(&mut server), Some(sample_instruction(0)));
        assert_eq!(server.expected_receiver_seq(), 6);

        // The regressed sequence number violates stream ordering.
        std::thread::sleep(Duration::from_millis(50));
        assert!(server.recv().unwrap().is_none());
        assert_eq!(server.expected_receiver_seq(), 6);
    }

    #[test]
    fn test_server_survives_client_disconnect() {
        let (mut server, client) = pair();
        std::thread::sleep(Duration::from_millis(20));
        let _ = server.recv().unwrap();

        drop(client);
        // Drain until the server notices the close.
        for _ in 0..100 {
            let _ = server.recv().unwrap();
            if !server.connection_established {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        // The listener stays; a new client can attach.
        assert!(server.server_socket.is_some());
        assert!(server.tcp_port().is_some());
    }

    #[test]
    fn test_port_exposure() {
        let (server, client) = pair();
        assert!(server.tcp_port().is_some());
        assert!(server.udp_port().is_none());
        assert!(client.tcp_port().is_some());
    }
}
