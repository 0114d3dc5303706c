//! Configuration for a mesh node.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::DEFAULT_TTL;

/// Configuration for the mesh networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Interface the listener binds to.
    pub listen_host: String,

    /// Host advertised to peers in HELLO / HELLO_ACK. Receivers replace a
    /// wildcard or loopback host with the address they observe the
    /// connection from, so the default works across hosts.
    pub advertise_host: String,

    /// Interval between heartbeats sent to every open connection.
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Interval between liveness / dedup cleanup passes.
    #[serde(with = "duration_serde")]
    pub cleanup_interval: Duration,

    /// A peer not heard from for this long is marked offline.
    #[serde(with = "duration_serde")]
    pub stale_after: Duration,

    /// Timeout for establishing an outbound connection.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Hop budget stamped on messages this node originates.
    pub default_ttl: u32,

    /// Hard ceiling on remembered message ids.
    pub dedup_capacity: usize,

    /// Number of message ids forgotten per cleanup pass.
    pub dedup_evict_batch: usize,

    /// Largest accepted frame body, in bytes.
    pub max_frame_bytes: usize,

    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,

    /// Endpoints dialed once when the node starts.
    pub bootstrap_peers: Vec<String>,

    /// Snapshot exchange settings.
    pub sync: SyncConfig,
}

/// Settings for snapshot exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Packages larger than this (serialized) are ignored.
    pub max_package_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_package_bytes: 10_000_000,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            default_ttl: DEFAULT_TTL,
            dedup_capacity: 100_000,
            dedup_evict_batch: 1000,
            max_frame_bytes: 16 * 1024 * 1024,
            outbound_queue: 256,
            bootstrap_peers: Vec::new(),
            sync: SyncConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<MeshConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt mesh config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read mesh config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }

    /// A config suited to tests: loopback only, timers effectively off.
    pub fn loopback() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            heartbeat_interval: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
