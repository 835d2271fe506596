use crate::*;

use simwire_core::message::PacketAck;
use simwire_core::wire::MAX_PACKET_SIZE;
use simwire_core::{GenericStreamingMessage, Packet, PacketFlags};
use simwire_services::{
    BufferPool, InboundPacket, PacketIngest, PacketSource, TransportError, UdpTransport,
};

fn circuit() -> (UdpTransport, mpsc::UnboundedReceiver<InboundPacket>) {
    let config = test_config();
    let (sink, rx) = mpsc::unbounded_channel();
    let transport = UdpTransport::new(
        config.network.clone(),
        BufferPool::with_preallocated(MAX_PACKET_SIZE, 4),
        Arc::new(PacketIngest::new(sink)),
    );
    (transport, rx)
}

fn loopback() -> SocketAddr {
    test_config().network.bind_addr
}

// ══════════════════════════════════════════════════════════════════════════════
//  UDP circuit
// ══════════════════════════════════════════════════════════════════════════════

/// A reliable, zero-coded packet with appended acks crosses loopback intact.
#[tokio::test]
async fn packets_cross_the_circuit() {
    let (viewer, _viewer_rx) = circuit();
    let (sim, mut sim_rx) = circuit();
    let viewer_addr = viewer.start(loopback()).unwrap();
    let sim_addr = sim.start(loopback()).unwrap();

    let packet = Packet::new(GenericStreamingMessage::new(0x0304, vec![0, 0, 0, 1, 2]).unwrap())
        .with_sequence(1_000)
        .with_flags(PacketFlags::RELIABLE | PacketFlags::ZERO_CODED)
        .with_acks(vec![7, 8]);
    let sent = viewer.send_packet(sim_addr, &packet).await.unwrap();
    assert!(sent > 0);

    let inbound = next_matching(&mut sim_rx, "packet", |_| true).await;
    assert_eq!(inbound.source, PacketSource::Udp(viewer_addr));
    assert_eq!(inbound.packet.header().sequence, 1_000);
    assert_eq!(inbound.packet.header().acks, vec![7, 8]);
    assert!(inbound.packet.header().is_reliable());
    assert_eq!(inbound.packet.message(), packet.message());

    assert_eq!(viewer.stats().packets_sent, 1);
    assert_eq!(sim.stats().packets_received, 1);
}

/// Malformed datagrams are dropped and the circuit keeps delivering.
#[tokio::test]
async fn malformed_datagram_does_not_stop_receiving() {
    let (viewer, _viewer_rx) = circuit();
    let (sim, mut sim_rx) = circuit();
    viewer.start(loopback()).unwrap();
    let sim_addr = sim.start(loopback()).unwrap();

    viewer.send(sim_addr, &[0x40, 0x00]).await.unwrap();
    let ack = Packet::new(PacketAck::new([42]).unwrap()).with_sequence(2);
    viewer.send_packet(sim_addr, &ack).await.unwrap();

    let inbound = next_matching(&mut sim_rx, "valid packet", |_| true).await;
    assert_eq!(inbound.packet, ack);
    wait_for_condition("both datagrams counted", || sim.stats().packets_received == 2).await;
}

/// Address reuse is off: a second circuit cannot take a bound port.
#[tokio::test]
async fn bound_port_is_exclusive() {
    let (first, _rx1) = circuit();
    let (second, _rx2) = circuit();
    let addr = first.start(loopback()).unwrap();

    match second.start(addr) {
        Err(TransportError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
        other => panic!("expected bind failure, got {other:?}"),
    }
}

/// After stop, sends are refused; the socket is released and can be rebound.
#[tokio::test]
async fn stopped_transport_refuses_sends_and_releases_port() {
    let (transport, _rx) = circuit();
    let addr = transport.start(loopback()).unwrap();
    transport.stop();
    transport.stop();

    assert!(matches!(
        transport.send(addr, b"late").await,
        Err(TransportError::NotRunning)
    ));
    assert_eq!(transport.local_addr(), None);

    let (again, _rx) = circuit();
    wait_for_condition("port released", || {
        let probe = std::net::UdpSocket::bind(addr);
        probe.is_ok()
    })
    .await;
    assert_eq!(again.start(addr).unwrap(), addr);
}
