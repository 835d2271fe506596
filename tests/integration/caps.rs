use crate::*;

use serde_json::json;
use simwire_services::{Caps, CapsError, CapsEvent, EventQueueState};

fn granted(sim: &MockSim) -> Value {
    json!({
        "EventQueueGet": sim.url("/eq").as_str(),
        "GetTexture": sim.url("/tex").as_str(),
        "ViewerAsset": sim.url("/asset").as_str(),
    })
}

// ══════════════════════════════════════════════════════════════════════════════
//  Seed negotiation
// ══════════════════════════════════════════════════════════════════════════════

/// Two 503s, then a map. Negotiation retries until it succeeds, the registry
/// holds every returned name, and the event queue comes up.
#[tokio::test]
async fn seed_retries_through_unavailable_then_runs_event_queue() {
    let sim = MockSim::start().await.unwrap();
    sim.push_seed(StatusCode::SERVICE_UNAVAILABLE, Value::Null);
    sim.push_seed(StatusCode::SERVICE_UNAVAILABLE, Value::Null);
    sim.push_seed(StatusCode::OK, granted(&sim));
    sim.push_poll(StatusCode::OK, json!({ "events": [], "id": 1 }));

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (packets_tx, _packets) = mpsc::unbounded_channel();
    let config = test_config();
    let caps = Caps::new(&config, events_tx, packets_tx);
    caps.connect(sim.seed_url());

    let received = next_matching(&mut events, "capabilities", |e| {
        matches!(e, CapsEvent::CapabilitiesReceived { .. })
    })
    .await;
    assert_eq!(received, CapsEvent::CapabilitiesReceived { count: 3 });

    let requests = sim.seed_requests();
    assert_eq!(requests.len(), 3, "one request per attempt");
    assert_eq!(requests[0], json!(config.caps.requested));

    assert_eq!(
        caps.registry().names(),
        vec!["EventQueueGet", "GetTexture", "ViewerAsset"]
    );
    assert_eq!(caps.registry().texture_uri(), Some(sim.url("/asset")));
    assert_eq!(caps.seed_uri(), Some(sim.seed_url()));

    let mut state = caps.event_queue_watch().expect("event queue started");
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == EventQueueState::Running))
        .await
        .expect("event queue never ran")
        .unwrap();
    next_matching(&mut events, "event queue connected", |e| {
        *e == CapsEvent::EventQueueConnected
    })
    .await;

    // The follow-up poll acknowledges the first response.
    wait_for_condition("second poll", || sim.poll_requests().len() >= 2).await;
    let polls = sim.poll_requests();
    assert_eq!(polls[0], json!({ "ack": null, "done": false }));
    assert_eq!(polls[1], json!({ "ack": 1, "done": false }));

    caps.disconnect();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == EventQueueState::Stopped))
        .await
        .expect("event queue never stopped")
        .unwrap();
}

/// A 404 from the seed is final: one error, one request, nothing after.
#[tokio::test]
async fn seed_not_found_is_terminal() {
    let sim = MockSim::start().await.unwrap();
    sim.push_seed(StatusCode::NOT_FOUND, Value::Null);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (packets_tx, _packets) = mpsc::unbounded_channel();
    let caps = Caps::new(&test_config(), events_tx, packets_tx);
    caps.connect(sim.seed_url());

    let event = next_matching(&mut events, "caps error", |_| true).await;
    assert_eq!(
        event,
        CapsEvent::Error(CapsError::NotFoundOnInit { status: 404 })
    );

    // Long enough for several retries had it kept going.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sim.seed_requests().len(), 1);
    assert!(events.try_recv().is_err(), "no further events");
    assert!(caps.registry().is_empty());
    assert_eq!(caps.event_queue_state(), EventQueueState::Stopped);
}

/// Non-object bodies are transient and retried like any other failure.
#[tokio::test]
async fn malformed_seed_body_is_retried() {
    let sim = MockSim::start().await.unwrap();
    sim.push_seed(StatusCode::OK, json!(["not", "a", "map"]));
    sim.push_seed(StatusCode::OK, json!({ "GetMesh": sim.url("/mesh").as_str() }));

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (packets_tx, _packets) = mpsc::unbounded_channel();
    let caps = Caps::new(&test_config(), events_tx, packets_tx);
    caps.connect(sim.seed_url());

    let received = next_matching(&mut events, "capabilities", |_| true).await;
    assert_eq!(received, CapsEvent::CapabilitiesReceived { count: 1 });
    assert_eq!(sim.seed_requests().len(), 2);
    assert_eq!(caps.registry().mesh_uri(), Some(sim.url("/mesh")));
    assert!(caps.event_queue_watch().is_none(), "no queue without EventQueueGet");
}

/// Disconnecting mid-negotiation cancels it without publishing anything.
#[tokio::test]
async fn disconnect_cancels_negotiation() {
    let sim = MockSim::start().await.unwrap();
    // Script is empty, so every attempt gets a 500 and is retried.

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (packets_tx, _packets) = mpsc::unbounded_channel();
    let caps = Caps::new(&test_config(), events_tx, packets_tx);
    caps.connect(sim.seed_url());

    wait_for_condition("first seed attempt", || !sim.seed_requests().is_empty()).await;
    caps.disconnect();
    let attempts = sim.seed_requests().len();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sim.seed_requests().len() <= attempts + 1);
    assert!(events.try_recv().is_err());
}
