//! Tunables for every component, with reference defaults from the protocol
//! design. Loadable from a config file (TOML/YAML/JSON, via the `config`
//! crate) layered under environment overrides, e.g. `MESH_RELAY__JITTER_HIGH_DEGREE_MS`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub max_envelope_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_envelope_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub mtu: usize,
    pub chunk_header_bytes: usize,
    pub assembly_expiry: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            mtu: 182,
            chunk_header_bytes: 20,
            assembly_expiry: Duration::from_secs(30),
        }
    }
}

impl ChunkConfig {
    pub fn payload_bytes(&self) -> usize {
        self.mtu.saturating_sub(self.chunk_header_bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub max_ttl: u8,
    pub default_ttl: u8,
    pub route_expiry: Duration,
    pub route_discovery_timeout: Duration,
    pub min_reliability: f32,
    pub route_sweep_interval: Duration,
    pub seen_request_capacity: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_ttl: 8,
            default_ttl: 3,
            route_expiry: Duration::from_secs(300),
            route_discovery_timeout: Duration::from_secs(10),
            min_reliability: 0.3,
            route_sweep_interval: Duration::from_secs(60),
            seen_request_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub seen_set_retention: Duration,
    pub jitter_high_degree_threshold: usize,
    pub jitter_high_degree_ms: (u64, u64),
    pub jitter_medium_degree_ms: (u64, u64),
    pub jitter_low_degree_ms: (u64, u64),
    pub fanout_suppression_degree: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            seen_set_retention: Duration::from_secs(300),
            jitter_high_degree_threshold: 5,
            jitter_high_degree_ms: (30, 80),
            jitter_medium_degree_ms: (20, 60),
            jitter_low_degree_ms: (10, 50),
            fanout_suppression_degree: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub ack_timeout: Duration,
    pub retry_backoff_initial: Duration,
    pub retry_backoff_cap: Duration,
    pub max_retries: u32,
    pub offline_queue_capacity: usize,
    pub offline_item_expiry: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            retry_backoff_initial: Duration::from_secs(2),
            retry_backoff_cap: Duration::from_secs(30),
            max_retries: 5,
            offline_queue_capacity: 100,
            offline_item_expiry: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub replay_window: u64,
    pub replay_persist_every: u32,
    pub replay_persist_interval: Duration,
    /// Reject unsigned envelopes. Default policy for new deployments per §4.3.
    pub require_signature: bool,
    /// Reject sending/accepting unencrypted directed payloads. A single
    /// envelope type carries both encrypted and plaintext traffic (§9); this
    /// is deployment policy, not a second envelope type.
    pub require_encryption: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            replay_window: 64,
            replay_persist_every: 16,
            replay_persist_interval: Duration::from_secs(5),
            require_signature: true,
            require_encryption: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MeshConfig {
    pub codec: CodecConfig,
    pub chunk: ChunkConfig,
    pub routing: RoutingConfig,
    pub relay: RelayConfig,
    pub delivery: DeliveryConfig,
    pub crypto: CryptoConfig,
}

impl MeshConfig {
    /// Load from an optional file path, overridden by `MESH_*` environment variables,
    /// falling back to the reference defaults if no file is present.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&MeshConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MESH")
                .separator("__")
                .try_parsing(true),
        );
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }
}
