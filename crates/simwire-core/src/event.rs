//! Event-queue message shapes.
//!
//! The simulator's event queue delivers `{message, body}` pairs. Bodies of
//! the events below are decoded into typed structs; anything else is handed
//! back to the caller untouched so it can try the legacy packet fallback.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Region handoff ────────────────────────────────────────────────────────────

/// Sent when a neighbouring region wants the agent to open a circuit to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstablishAgentCommunication {
    #[serde(rename = "agent-id")]
    pub agent_id: String,
    #[serde(rename = "sim-ip-and-port")]
    pub sim_ip_and_port: String,
    #[serde(rename = "seed-capability")]
    pub seed_capability: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleportFinishInfo {
    #[serde(rename = "AgentID")]
    pub agent_id: String,
    #[serde(rename = "LocationID")]
    pub location_id: u32,
    #[serde(rename = "SimIP")]
    pub sim_ip: String,
    #[serde(rename = "SimPort")]
    pub sim_port: u16,
    #[serde(rename = "RegionHandle")]
    pub region_handle: u64,
    #[serde(rename = "SeedCapability")]
    pub seed_capability: String,
    #[serde(rename = "SimAccess", default)]
    pub sim_access: u8,
    #[serde(rename = "TeleportFlags", default)]
    pub teleport_flags: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleportFinish {
    #[serde(rename = "Info")]
    pub info: Vec<TeleportFinishInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossedRegionData {
    #[serde(rename = "RegionHandle")]
    pub region_handle: u64,
    #[serde(rename = "SeedCapability")]
    pub seed_capability: String,
    #[serde(rename = "SimIP")]
    pub sim_ip: String,
    #[serde(rename = "SimPort")]
    pub sim_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossedRegion {
    #[serde(rename = "RegionData")]
    pub region_data: Vec<CrossedRegionData>,
}

// ── Group messaging ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatterBoxInvitation {
    pub session_id: String,
    pub from_id: String,
    pub from_name: String,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatterBoxSessionStartReply {
    pub session_id: String,
    #[serde(default)]
    pub temp_session_id: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupData {
    #[serde(rename = "GroupID")]
    pub group_id: String,
    #[serde(rename = "GroupName")]
    pub group_name: String,
    #[serde(rename = "AcceptNotices", default)]
    pub accept_notices: bool,
    #[serde(rename = "Contribution", default)]
    pub contribution: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentGroupDataUpdate {
    #[serde(rename = "GroupData")]
    pub group_data: Vec<GroupData>,
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// A decoded event-queue message.
#[derive(Debug, Clone, PartialEq)]
pub enum EventMessage {
    EstablishAgentCommunication(EstablishAgentCommunication),
    TeleportFinish(TeleportFinish),
    CrossedRegion(CrossedRegion),
    ChatterBoxInvitation(ChatterBoxInvitation),
    ChatterBoxSessionStartReply(ChatterBoxSessionStartReply),
    AgentGroupDataUpdate(AgentGroupDataUpdate),
}

impl EventMessage {
    pub fn name(&self) -> &'static str {
        match self {
            EventMessage::EstablishAgentCommunication(_) => "EstablishAgentCommunication",
            EventMessage::TeleportFinish(_) => "TeleportFinish",
            EventMessage::CrossedRegion(_) => "CrossedRegion",
            EventMessage::ChatterBoxInvitation(_) => "ChatterBoxInvitation",
            EventMessage::ChatterBoxSessionStartReply(_) => "ChatterBoxSessionStartReply",
            EventMessage::AgentGroupDataUpdate(_) => "AgentGroupDataUpdate",
        }
    }
}

/// Turns an event body into a typed message.
pub type EventDecoder = fn(Value) -> Result<EventMessage, serde_json::Error>;

/// Event name → typed decoder.
#[derive(Clone)]
pub struct EventRegistry {
    decoders: HashMap<String, EventDecoder>,
}

impl EventRegistry {
    /// A registry with no decoders. Every event falls through.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, decoder: EventDecoder) {
        self.decoders.insert(name.into(), decoder);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    /// Decode `body` as the message registered under `name`.
    ///
    /// Returns `None` when no decoder is registered for the name.
    pub fn decode(&self, name: &str, body: Value) -> Option<Result<EventMessage, serde_json::Error>> {
        self.decoders.get(name).map(|decoder| decoder(body))
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("EstablishAgentCommunication", |v| {
            serde_json::from_value(v).map(EventMessage::EstablishAgentCommunication)
        });
        registry.register("TeleportFinish", |v| {
            serde_json::from_value(v).map(EventMessage::TeleportFinish)
        });
        registry.register("CrossedRegion", |v| {
            serde_json::from_value(v).map(EventMessage::CrossedRegion)
        });
        registry.register("ChatterBoxInvitation", |v| {
            serde_json::from_value(v).map(EventMessage::ChatterBoxInvitation)
        });
        registry.register("ChatterBoxSessionStartReply", |v| {
            serde_json::from_value(v).map(EventMessage::ChatterBoxSessionStartReply)
        });
        registry.register("AgentGroupDataUpdate", |v| {
            serde_json::from_value(v).map(EventMessage::AgentGroupDataUpdate)
        });
        registry
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.decoders.keys().collect();
        names.sort();
        f.debug_struct("EventRegistry").field("names", &names).finish()
    }
}
