//! End-to-end loopback scenarios through the public API.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roamlink::{
    client_transport, server_transport, Base64Key, Instruction, PortRange, Report, Transport,
    TransportMode,
};

fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn sample_instruction(tag: u64, payload: &[u8]) -> Instruction {
    Instruction {
        old_num: tag,
        new_num: tag + 1,
        ack_num: tag,
        throwaway_num: 0,
        payload: payload.to_vec(),
    }
}

fn recv_until(t: &mut dyn Transport) -> Option<Instruction> {
    for _ in 0..400 {
        if let Some(inst) = t.recv().unwrap() {
            return Some(inst);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    None
}

fn connected_pair(mode: TransportMode) -> (Box<dyn Transport>, Box<dyn Transport>) {
    let key = Base64Key::random();
    let server = server_transport(
        mode,
        &key,
        Some(localhost()),
        PortRange::single(0),
        PortRange::single(0),
    )
    .unwrap();
    let client = client_transport(
        mode,
        &key,
        localhost(),
        server.udp_port().unwrap_or(1),
        server.tcp_port().unwrap_or(1),
    )
    .unwrap();

    // Let a non-blocking TCP connect finish before the first send.
    std::thread::sleep(Duration::from_millis(20));
    (server, client)
}

#[test]
fn udp_roundtrip_both_directions() {
    let (mut server, mut client) = connected_pair(TransportMode::UdpOnly);

    let hello = sample_instruction(0, b"hi");
    client.send(&hello).unwrap();
    assert_eq!(recv_until(server.as_mut()), Some(hello));
    assert!(server.has_remote_addr());

    let reply = sample_instruction(1, b"hello yourself");
    server.send(&reply).unwrap();
    assert_eq!(recv_until(client.as_mut()), Some(reply));

    // A completed round trip replaces the pessimistic RTT prior.
    assert!(client.srtt() < 1000.0);
    assert!((50..=1000).contains(&client.timeout()));
}

#[test]
fn udp_large_payload_fragments_and_reassembles() {
    let (mut server, mut client) = connected_pair(TransportMode::UdpOnly);

    // Incompressible payload several times the MTU.
    let payload: Vec<u8> = (0u32..8192)
        .map(|i| (i.wrapping_mul(2654435761) >> 7) as u8)
        .collect();
    let inst = sample_instruction(3, &payload);
    client.send(&inst).unwrap();
    assert_eq!(recv_until(server.as_mut()), Some(inst));
}

#[test]
fn tcp_instructions_arrive_in_order() {
    let (mut server, mut client) = connected_pair(TransportMode::TcpOnly);

    for tag in 0..3 {
        client.send(&sample_instruction(tag, b"ordered")).unwrap();
    }
    for tag in 0..3 {
        let inst = recv_until(server.as_mut()).expect("missing instruction");
        assert_eq!(inst, sample_instruction(tag, b"ordered"));
    }
}

#[test]
fn combined_roundtrip_and_port_exposure() {
    let (mut server, mut client) = connected_pair(TransportMode::PreferUdp);

    assert!(server.udp_port().is_some());
    assert!(server.tcp_port().is_some());

    let inst = sample_instruction(0, b"combined");
    client.send(&inst).unwrap();
    assert_eq!(recv_until(server.as_mut()), Some(inst));

    let reply = sample_instruction(1, b"ack");
    server.send(&reply).unwrap();
    assert_eq!(recv_until(client.as_mut()), Some(reply));
    assert!(client.remote_addr().is_some());
}

#[test]
fn reports_fire_on_send_and_receive() {
    let (mut server, mut client) = connected_pair(TransportMode::UdpOnly);

    let sends = Arc::new(AtomicUsize::new(0));
    let recvs = Arc::new(AtomicUsize::new(0));
    let (send_count, recv_count) = (Arc::clone(&sends), Arc::clone(&recvs));

    client.set_report_function(Arc::new(move |report| {
        if matches!(report, Report::UdpSend { .. }) {
            send_count.fetch_add(1, Ordering::SeqCst);
        }
    }));
    server.set_report_function(Arc::new(move |report| {
        if matches!(report, Report::UdpRecv { .. }) {
            recv_count.fetch_add(1, Ordering::SeqCst);
        }
    }));

    client.send(&sample_instruction(0, b"observed")).unwrap();
    recv_until(server.as_mut()).expect("nothing received");

    assert_eq!(sends.load(Ordering::SeqCst), 1);
    assert_eq!(recvs.load(Ordering::SeqCst), 1);
}

#[test]
fn idle_transport_reports_clean_state() {
    let (mut server, mut client) = connected_pair(TransportMode::PreferUdp);

    assert!(server.finish_send());
    assert!(client.finish_send());
    assert!(server.clear_send_error().is_empty());
    assert!(client.clear_send_error().is_empty());
    assert!(!server.fds_notify_read().is_empty());
}

#[test]
fn mode_parsing_selects_transport() {
    let key = Base64Key::random();
    let udp_only = server_transport(
        "udp".parse().unwrap(),
        &key,
        Some(localhost()),
        PortRange::single(0),
        PortRange::single(0),
    )
    .unwrap();
    assert!(udp_only.udp_port().is_some());
    assert!(udp_only.tcp_port().is_none());

    let tcp_only = server_transport(
        "tcp".parse().unwrap(),
        &key,
        Some(localhost()),
        PortRange::single(0),
        PortRange::single(0),
    )
    .unwrap();
    assert!(tcp_only.udp_port().is_none());
    assert!(tcp_only.tcp_port().is_some());
}
