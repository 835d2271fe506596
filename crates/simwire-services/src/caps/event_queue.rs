//! Long-poll client for the `EventQueueGet` capability.
//!
//! One request is in flight at a time. Each response carries an id that the
//! next request acknowledges. The server answers 502/504 when a poll expires
//! with nothing to deliver; anything else non-2xx ends the queue for good.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use simwire_core::config::EventQueueConfig;
use simwire_core::{EventRegistry, Packet};

use super::CapsEvent;
use crate::ingest::{InboundPacket, PacketSink, PacketSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventQueueState {
    Stopped,
    Connecting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    None,
    /// Let the in-flight poll finish, then stop.
    Graceful,
    /// Abandon the in-flight poll.
    Immediate,
}

#[derive(Debug, Serialize)]
struct PollRequest {
    ack: Option<i64>,
    done: bool,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    events: Vec<RawEvent>,
    id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    message: String,
    #[serde(default)]
    body: Value,
}

enum PollOutcome {
    Delivered(PollResponse),
    Expired(StatusCode),
    Failed(String),
}

/// Handle to a running poll loop. Dropping it stops the loop immediately.
pub struct EventQueueClient {
    uri: Url,
    state: Arc<watch::Sender<EventQueueState>>,
    stop: watch::Sender<StopRequest>,
}

/// What the poll task needs to deliver events.
pub struct Delivery {
    pub registry: Arc<EventRegistry>,
    pub events: mpsc::UnboundedSender<CapsEvent>,
    pub packets: PacketSink,
}

impl EventQueueClient {
    /// Spawn the poll loop against `uri`. Must be called inside a tokio runtime.
    pub fn start(
        http: reqwest::Client,
        uri: Url,
        config: &EventQueueConfig,
        delivery: Delivery,
    ) -> Self {
        let (state, _) = watch::channel(EventQueueState::Connecting);
        let state = Arc::new(state);
        let (stop, stop_rx) = watch::channel(StopRequest::None);

        let poller = Poller {
            http,
            uri: uri.clone(),
            poll_timeout: config.poll_timeout(),
            delivery,
            state: state.clone(),
            stop: stop_rx,
        };
        tokio::spawn(poller.run());
        tracing::info!(%uri, "event queue connecting");

        Self { uri, state, stop }
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn state(&self) -> EventQueueState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<EventQueueState> {
        self.state.subscribe()
    }

    /// Ask the loop to stop. `immediate` abandons the request in flight;
    /// otherwise the current poll completes and no new one is issued.
    pub fn stop(&self, immediate: bool) {
        let request = if immediate {
            StopRequest::Immediate
        } else {
            StopRequest::Graceful
        };
        self.stop.send_if_modified(|current| {
            if *current == StopRequest::Immediate || *current == request {
                return false;
            }
            *current = request;
            true
        });
        self.state.send_if_modified(|state| {
            if matches!(state, EventQueueState::Connecting | EventQueueState::Running) {
                *state = EventQueueState::Stopping;
                return true;
            }
            false
        });
    }
}

struct Poller {
    http: reqwest::Client,
    uri: Url,
    poll_timeout: Duration,
    delivery: Delivery,
    state: Arc<watch::Sender<EventQueueState>>,
    stop: watch::Receiver<StopRequest>,
}

impl Poller {
    async fn run(mut self) {
        let mut ack: Option<i64> = None;
        let mut connected = false;

        loop {
            if *self.stop.borrow() != StopRequest::None {
                break;
            }

            let outcome = tokio::select! {
                biased;
                _ = immediate_stop(&mut self.stop) => break,
                outcome = poll_once(&self.http, &self.uri, self.poll_timeout, ack) => outcome,
            };

            match outcome {
                PollOutcome::Delivered(response) => {
                    if !connected {
                        connected = true;
                        // A stop requested while connecting leaves the state at Stopping.
                        let running = self.state.send_if_modified(|state| {
                            if *state == EventQueueState::Connecting {
                                *state = EventQueueState::Running;
                                return true;
                            }
                            false
                        });
                        if running {
                            tracing::info!(uri = %self.uri, "event queue running");
                            let _ = self.delivery.events.send(CapsEvent::EventQueueConnected);
                        }
                    }
                    if response.id.is_some() {
                        ack = response.id;
                    }
                    for event in response.events {
                        self.dispatch(event);
                    }
                }
                PollOutcome::Expired(status) => {
                    tracing::debug!(uri = %self.uri, %status, "event poll expired, re-polling");
                }
                PollOutcome::Failed(reason) => {
                    tracing::warn!(uri = %self.uri, %reason, "event queue failed");
                    break;
                }
            }
        }

        self.state.send_replace(EventQueueState::Stopped);
        tracing::info!(uri = %self.uri, "event queue stopped");
        let _ = self.delivery.events.send(CapsEvent::EventQueueStopped);
    }

    fn dispatch(&self, event: RawEvent) {
        let RawEvent { message, body } = event;

        if self.delivery.registry.contains(&message) {
            match self.delivery.registry.decode(&message, body) {
                Some(Ok(decoded)) => {
                    tracing::debug!(event = %message, "event received");
                    let _ = self.delivery.events.send(CapsEvent::Message(decoded));
                }
                Some(Err(e)) => {
                    tracing::warn!(event = %message, error = %e, "malformed event body, dropped");
                }
                None => {}
            }
            return;
        }

        match packet_from_body(&body) {
            Some(packet) => {
                tracing::debug!(event = %message, packet = packet.name(), "event carried a packet");
                let _ = self.delivery.packets.send(InboundPacket {
                    source: PacketSource::EventQueue,
                    packet,
                });
            }
            None => {
                tracing::warn!(event = %message, "unhandled event, dropped");
            }
        }
    }
}

/// Resolves once an immediate stop is requested or the client is dropped.
async fn immediate_stop(stop: &mut watch::Receiver<StopRequest>) {
    let _ = stop
        .wait_for(|r| *r == StopRequest::Immediate)
        .await
        .map(|_| ());
}

async fn poll_once(
    http: &reqwest::Client,
    uri: &Url,
    timeout: Duration,
    ack: Option<i64>,
) -> PollOutcome {
    let request = PollRequest { ack, done: false };
    let response = match http
        .post(uri.clone())
        .timeout(timeout)
        .json(&request)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => return PollOutcome::Failed(format!("request failed: {e}")),
    };

    let status = response.status();
    if status == StatusCode::BAD_GATEWAY || status == StatusCode::GATEWAY_TIMEOUT {
        return PollOutcome::Expired(status);
    }
    if !status.is_success() {
        return PollOutcome::Failed(format!("server returned {status}"));
    }

    match response.json::<PollResponse>().await {
        Ok(body) => PollOutcome::Delivered(body),
        Err(e) => PollOutcome::Failed(format!("unreadable body: {e}")),
    }
}

/// Legacy fallback: the body is a hex-encoded UDP packet.
fn packet_from_body(body: &Value) -> Option<Packet> {
    let bytes = hex::decode(body.as_str()?).ok()?;
    Packet::decode(&bytes).ok()
}
