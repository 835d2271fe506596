//! Named HTTP capabilities granted by the simulator.
//!
//! [`Caps`] owns one connection's capability set: it negotiates the map from
//! the seed URI, keeps it in a [`CapabilityRegistry`], and runs the event
//! queue when the simulator grants one. Everything it learns is published on
//! a [`CapsEvent`] channel.

pub mod event_queue;
pub mod seed;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use simwire_core::config::{CapsConfig, EventQueueConfig, SimwireConfig};
use simwire_core::{EventMessage, EventRegistry};

use crate::ingest::PacketSink;
use crate::pool::lock;

pub use event_queue::{Delivery, EventQueueClient, EventQueueState};
pub use seed::{SeedNegotiator, SeedOutcome};
pub use simwire_core::config::DEFAULT_CAPABILITIES;

pub const EVENT_QUEUE_GET: &str = "EventQueueGet";

const TEXTURE_FALLBACK: &[&str] = &["ViewerAsset", "GetTexture"];
const MESH_FALLBACK: &[&str] = &["ViewerAsset", "GetMesh2", "GetMesh"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapsError {
    #[error("seed capability not found (HTTP {status})")]
    NotFoundOnInit { status: u16 },
}

/// Published by [`Caps`] as the connection progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum CapsEvent {
    CapabilitiesReceived { count: usize },
    Error(CapsError),
    EventQueueConnected,
    EventQueueStopped,
    Message(EventMessage),
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Capability name → URI. Readers see a consistent snapshot; writers swap
/// the whole map.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    map: ArcSwap<HashMap<String, Url>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uri_for(&self, name: &str) -> Option<Url> {
        self.map.load().get(name).cloned()
    }

    /// Preferred texture endpoint.
    pub fn texture_uri(&self) -> Option<Url> {
        self.first_of(TEXTURE_FALLBACK)
    }

    /// Preferred mesh endpoint.
    pub fn mesh_uri(&self) -> Option<Url> {
        self.first_of(MESH_FALLBACK)
    }

    fn first_of(&self, names: &[&str]) -> Option<Url> {
        let map = self.map.load();
        names.iter().find_map(|name| map.get(*name).cloned())
    }

    /// Reverse lookup. When several names share a URI, any one of them.
    pub fn name_for(&self, uri: &Url) -> Option<String> {
        self.map
            .load()
            .iter()
            .find(|(_, candidate)| *candidate == uri)
            .map(|(name, _)| name.clone())
    }

    pub fn replace(&self, map: HashMap<String, Url>) {
        self.map.store(Arc::new(map));
    }

    /// Add or overwrite entries, keeping the rest.
    pub fn merge(&self, entries: HashMap<String, Url>) {
        self.map.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
            next
        });
    }

    /// Sorted capability names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.load().is_empty()
    }

    pub fn clear(&self) {
        self.map.store(Arc::new(HashMap::new()));
    }
}

// ── Connection owner ──────────────────────────────────────────────────────────

/// The negotiation task and the generation it belongs to. Results from an
/// older generation are discarded, even when they finish after `abort`.
#[derive(Default)]
struct Negotiation {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Negotiation {
    fn cancel(&mut self) {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct Caps {
    caps_config: CapsConfig,
    event_queue_config: EventQueueConfig,
    http: reqwest::Client,
    registry: CapabilityRegistry,
    event_registry: Arc<EventRegistry>,
    events: mpsc::UnboundedSender<CapsEvent>,
    packets: PacketSink,
    seed: std::sync::Mutex<Option<Url>>,
    negotiation: std::sync::Mutex<Negotiation>,
    event_queue: std::sync::Mutex<Option<EventQueueClient>>,
}

impl Caps {
    pub fn new(
        config: &SimwireConfig,
        events: mpsc::UnboundedSender<CapsEvent>,
        packets: PacketSink,
    ) -> Arc<Self> {
        Self::with_event_registry(config, EventRegistry::default(), events, packets)
    }

    pub fn with_event_registry(
        config: &SimwireConfig,
        event_registry: EventRegistry,
        events: mpsc::UnboundedSender<CapsEvent>,
        packets: PacketSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            caps_config: config.caps.clone(),
            event_queue_config: config.event_queue.clone(),
            http: reqwest::Client::new(),
            registry: CapabilityRegistry::new(),
            event_registry: Arc::new(event_registry),
            events,
            packets,
            seed: std::sync::Mutex::new(None),
            negotiation: std::sync::Mutex::new(Negotiation::default()),
            event_queue: std::sync::Mutex::new(None),
        })
    }

    /// Negotiate capabilities from `seed` in the background.
    ///
    /// Replaces any negotiation already in flight and stops the current event
    /// queue. Must be called inside a tokio runtime.
    pub fn connect(self: &Arc<Self>, seed: Url) {
        let mut negotiation = lock(&self.negotiation);
        negotiation.cancel();
        let generation = negotiation.generation;
        self.stop_event_queue();
        *lock(&self.seed) = Some(seed.clone());

        let negotiator = SeedNegotiator::new(self.http.clone(), &self.caps_config);
        let names = self.caps_config.requested.clone();
        let owner: Weak<Self> = Arc::downgrade(self);

        tracing::info!(%seed, requested = names.len(), "negotiating capabilities");
        let task = tokio::spawn(async move {
            let result = negotiator.negotiate(&seed, &names).await;
            if let Some(caps) = owner.upgrade() {
                caps.publish(generation, result);
            }
        });
        negotiation.task = Some(task);
    }

    /// Cancel negotiation and stop the event queue. Publishes no
    /// capability events, even for a negotiation that already finished.
    pub fn disconnect(&self) {
        lock(&self.negotiation).cancel();
        self.stop_event_queue();
        tracing::info!("capabilities disconnected");
    }

    /// Start a fresh event queue if the last one stopped.
    ///
    /// Returns whether a new client was started.
    pub fn restart_event_queue(&self) -> bool {
        if self.event_queue_state() != EventQueueState::Stopped {
            return false;
        }
        self.start_event_queue()
    }

    pub fn event_queue_state(&self) -> EventQueueState {
        lock(&self.event_queue)
            .as_ref()
            .map_or(EventQueueState::Stopped, EventQueueClient::state)
    }

    pub fn event_queue_watch(&self) -> Option<watch::Receiver<EventQueueState>> {
        lock(&self.event_queue).as_ref().map(EventQueueClient::watch)
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn seed_uri(&self) -> Option<Url> {
        lock(&self.seed).clone()
    }

    /// Apply a negotiation result unless `generation` was cancelled. Holds
    /// the negotiation lock so `connect` and `disconnect` cannot interleave.
    fn publish(&self, generation: u64, result: Result<HashMap<String, Url>, CapsError>) {
        let negotiation = lock(&self.negotiation);
        if negotiation.generation != generation {
            tracing::debug!(generation, "negotiation cancelled, result discarded");
            return;
        }
        match result {
            Ok(map) => {
                let count = map.len();
                self.registry.replace(map);
                self.start_event_queue();
                let _ = self.events.send(CapsEvent::CapabilitiesReceived { count });
            }
            Err(e) => {
                let _ = self.events.send(CapsEvent::Error(e));
            }
        }
    }

    fn start_event_queue(&self) -> bool {
        let Some(uri) = self.registry.uri_for(EVENT_QUEUE_GET) else {
            tracing::debug!("no event queue capability granted");
            return false;
        };
        let client = EventQueueClient::start(
            self.http.clone(),
            uri,
            &self.event_queue_config,
            Delivery {
                registry: self.event_registry.clone(),
                events: self.events.clone(),
                packets: self.packets.clone(),
            },
        );
        if let Some(previous) = lock(&self.event_queue).replace(client) {
            previous.stop(true);
        }
        true
    }

    fn stop_event_queue(&self) {
        if let Some(client) = lock(&self.event_queue).as_ref() {
            client.stop(true);
        }
    }
}

impl Drop for Caps {
    fn drop(&mut self) {
        lock(&self.negotiation).cancel();
    }
}
