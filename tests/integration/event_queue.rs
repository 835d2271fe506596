use crate::*;

use serde_json::json;
use simwire_core::event::EventMessage;
use simwire_core::message::{StartPingCheck, StartPingIdBlock};
use simwire_core::{EventRegistry, Packet, PacketFlags};
use simwire_services::caps::Delivery;
use simwire_services::{Caps, CapsEvent, EventQueueClient, EventQueueState, PacketSource};

async fn connected_caps(
    sim: &MockSim,
) -> (
    Arc<Caps>,
    mpsc::UnboundedReceiver<CapsEvent>,
    mpsc::UnboundedReceiver<simwire_services::InboundPacket>,
) {
    sim.push_seed(
        StatusCode::OK,
        json!({ "EventQueueGet": sim.url("/eq").as_str() }),
    );
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (packets_tx, packets) = mpsc::unbounded_channel();
    let caps = Caps::new(&test_config(), events_tx, packets_tx);
    caps.connect(sim.seed_url());
    next_matching(&mut events, "capabilities", |e| {
        matches!(e, CapsEvent::CapabilitiesReceived { .. })
    })
    .await;
    (caps, events, packets)
}

fn teleport_finish() -> Value {
    json!({
        "Info": [{
            "AgentID": "agent",
            "LocationID": 1,
            "SimIP": "127.0.0.1",
            "SimPort": 13001,
            "RegionHandle": 1099511628032000u64,
            "SeedCapability": "http://127.0.0.1:1/seed"
        }]
    })
}

// ══════════════════════════════════════════════════════════════════════════════
//  Event dispatch
// ══════════════════════════════════════════════════════════════════════════════

/// An unregistered event whose body is a hex packet goes to the packet sink.
/// An unregistered event with an unparseable body is dropped quietly, and
/// registered events come through typed.
#[tokio::test]
async fn unknown_event_with_packet_body_is_ingested() {
    let sim = MockSim::start().await.unwrap();
    let packet = Packet::new(StartPingCheck {
        ping_id: StartPingIdBlock {
            ping_id: 4,
            oldest_unacked: 0,
        },
    })
    .with_sequence(77)
    .with_flags(PacketFlags::ZERO_CODED);
    let encoded = hex::encode(packet.encode().unwrap());

    sim.push_poll(
        StatusCode::OK,
        json!({
            "events": [
                { "message": "UnknownEvent", "body": encoded },
                { "message": "UnknownEvent", "body": "definitely not a packet" },
                { "message": "TeleportFinish", "body": teleport_finish() }
            ],
            "id": 5
        }),
    );

    let (caps, mut events, mut packets) = connected_caps(&sim).await;

    let inbound = next_matching(&mut packets, "ingested packet", |_| true).await;
    assert_eq!(inbound.source, PacketSource::EventQueue);
    assert_eq!(inbound.packet, packet);

    // TeleportFinish is dispatched after the garbage event, so once it
    // arrives the garbage has already been handled.
    let typed = next_matching(&mut events, "typed event", |e| {
        matches!(e, CapsEvent::Message(_))
    })
    .await;
    match typed {
        CapsEvent::Message(EventMessage::TeleportFinish(tf)) => {
            assert_eq!(tf.info[0].sim_port, 13001);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(packets.try_recv().is_err(), "garbage body was not ingested");
    assert_eq!(caps.event_queue_state(), EventQueueState::Running);

    caps.disconnect();
}

/// 502/504 mean "nothing yet": the client re-polls with the same ack.
#[tokio::test]
async fn gateway_errors_repoll_with_same_ack() {
    let sim = MockSim::start().await.unwrap();
    sim.push_poll(StatusCode::OK, json!({ "events": [], "id": 9 }));
    sim.push_poll(StatusCode::GATEWAY_TIMEOUT, Value::Null);
    sim.push_poll(StatusCode::BAD_GATEWAY, Value::Null);

    let (caps, _events, _packets) = connected_caps(&sim).await;

    wait_for_condition("four polls", || sim.poll_requests().len() >= 4).await;
    let polls = sim.poll_requests();
    for poll in &polls[1..4] {
        assert_eq!(poll, &json!({ "ack": 9, "done": false }));
    }
    assert_eq!(caps.event_queue_state(), EventQueueState::Running);

    caps.disconnect();
}

/// Any other error status stops the queue. It does not resume by itself,
/// but the owner can start a fresh one.
#[tokio::test]
async fn server_error_stops_queue_until_restarted() {
    let sim = MockSim::start().await.unwrap();
    sim.push_poll(StatusCode::INTERNAL_SERVER_ERROR, Value::Null);

    let (caps, mut events, _packets) = connected_caps(&sim).await;

    next_matching(&mut events, "queue stopped", |e| {
        *e == CapsEvent::EventQueueStopped
    })
    .await;
    assert_eq!(caps.event_queue_state(), EventQueueState::Stopped);

    let polls_before = sim.poll_requests().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sim.poll_requests().len(), polls_before, "no resume");

    assert!(caps.restart_event_queue());
    wait_for_condition("fresh client polls", || {
        sim.poll_requests().len() > polls_before
    })
    .await;
    assert_ne!(caps.event_queue_state(), EventQueueState::Stopped);
    assert!(!caps.restart_event_queue(), "already running");

    caps.disconnect();
}

// ══════════════════════════════════════════════════════════════════════════════
//  Stopping
// ══════════════════════════════════════════════════════════════════════════════

/// A graceful stop lets the poll in flight finish and deliver its events,
/// then issues no further poll.
#[tokio::test]
async fn graceful_stop_finishes_the_poll_in_flight() {
    let sim = MockSim::start().await.unwrap();
    sim.hold_polls(Duration::from_millis(300));
    sim.push_poll(
        StatusCode::OK,
        json!({
            "events": [{ "message": "TeleportFinish", "body": teleport_finish() }],
            "id": 3
        }),
    );

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (packets_tx, _packets) = mpsc::unbounded_channel();
    let client = EventQueueClient::start(
        reqwest::Client::new(),
        sim.url("/eq"),
        &test_config().event_queue,
        Delivery {
            registry: Arc::new(EventRegistry::default()),
            events: events_tx,
            packets: packets_tx,
        },
    );

    wait_for_condition("first poll in flight", || sim.poll_requests().len() == 1).await;
    client.stop(false);
    assert_eq!(client.state(), EventQueueState::Stopping);

    let mut seen = Vec::new();
    loop {
        let event = next_matching(&mut events, "event queue events", |_| true).await;
        if event == CapsEvent::EventQueueStopped {
            break;
        }
        seen.push(event);
    }
    assert!(
        matches!(seen.as_slice(), [CapsEvent::Message(EventMessage::TeleportFinish(_))]),
        "unexpected events {seen:?}"
    );
    assert_eq!(client.state(), EventQueueState::Stopped);
    assert_eq!(sim.polls_answered(), 1, "the poll in flight completed");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sim.poll_requests().len(), 1, "no poll after a graceful stop");
}
