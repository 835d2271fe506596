//! Configuration system for simwire.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SIMWIRE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/simwire/config.toml
//!   3. ~/.config/simwire/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Capabilities requested from the seed when the config does not override them.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "AgentPreferences",
    "ChatSessionRequest",
    "CopyInventoryFromNotecard",
    "CreateInventoryCategory",
    "EventQueueGet",
    "FetchInventory2",
    "FetchInventoryDescendents2",
    "FetchLib2",
    "FetchLibDescendents2",
    "GetDisplayNames",
    "GetMesh",
    "GetMesh2",
    "GetTexture",
    "GroupMemberData",
    "MapLayer",
    "NewFileAgentInventory",
    "ParcelPropertiesUpdate",
    "RemoteParcelRequest",
    "SendPostcard",
    "SimulatorFeatures",
    "UpdateAgentInformation",
    "UpdateNotecardAgentInventory",
    "UpdateScriptAgent",
    "UpdateScriptTask",
    "UploadBakedTexture",
    "ViewerAsset",
    "ViewerStats",
];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimwireConfig {
    pub network: NetworkConfig,
    pub caps: CapsConfig,
    pub event_queue: EventQueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local UDP address for the simulator circuit. Port 0 = OS-assigned.
    pub bind_addr: SocketAddr,
    /// Receive buffers allocated up front.
    pub pool_buffers: usize,
    /// Cap on a single datagram send.
    pub send_timeout_ms: u64,
    /// Silence after which the receive loop logs a warning.
    pub watchdog_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsConfig {
    /// Capability names sent to the seed.
    pub requested: Vec<String>,
    /// Per-attempt timeout for the seed request.
    pub request_timeout_ms: u64,
    /// First retry delay after a failed seed request.
    pub retry_initial_ms: u64,
    /// Retry delay ceiling.
    pub retry_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQueueConfig {
    /// How long a single long-poll may stay open.
    pub poll_timeout_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            pool_buffers: 64,
            send_timeout_ms: 1_000,
            watchdog_ms: 10_000,
        }
    }
}

impl Default for CapsConfig {
    fn default() -> Self {
        Self {
            requested: DEFAULT_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
            request_timeout_ms: 30_000,
            retry_initial_ms: 500,
            retry_max_ms: 30_000,
        }
    }
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 60_000,
        }
    }
}

impl NetworkConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }
}

impl CapsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

impl EventQueueConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("simwire")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SimwireConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SimwireConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SIMWIRE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SimwireConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SIMWIRE_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("SIMWIRE_NETWORK__BIND_ADDR").and_then(|v| v.parse().ok()) {
            self.network.bind_addr = addr;
        }
        if let Some(n) = lookup("SIMWIRE_NETWORK__POOL_BUFFERS").and_then(|v| v.parse().ok()) {
            self.network.pool_buffers = n;
        }
        if let Some(ms) = lookup("SIMWIRE_NETWORK__SEND_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.network.send_timeout_ms = ms;
        }
        if let Some(ms) = lookup("SIMWIRE_NETWORK__WATCHDOG_MS").and_then(|v| v.parse().ok()) {
            self.network.watchdog_ms = ms;
        }
        // Comma-separated capability names.
        if let Some(v) = lookup("SIMWIRE_CAPS__REQUESTED") {
            self.caps.requested = v
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(ms) = lookup("SIMWIRE_CAPS__REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.caps.request_timeout_ms = ms;
        }
        if let Some(ms) = lookup("SIMWIRE_CAPS__RETRY_INITIAL_MS").and_then(|v| v.parse().ok()) {
            self.caps.retry_initial_ms = ms;
        }
        if let Some(ms) = lookup("SIMWIRE_CAPS__RETRY_MAX_MS").and_then(|v| v.parse().ok()) {
            self.caps.retry_max_ms = ms;
        }
        if let Some(ms) = lookup("SIMWIRE_EVENT_QUEUE__POLL_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            self.event_queue.poll_timeout_ms = ms;
        }
    }
}
