use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults;

/// Failures while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub coordinator: CoordinatorConfig,
    pub gossip: GossipConfig,
    pub pricing: PricingConfig,
    pub ledger: LedgerConfig,
    pub ble: BleConfig,
    pub rpc: RpcConfig,
    pub model: ModelConfig,

    /// Data directory for the sled store. `None` selects the in-memory
    /// store (state lost on restart).
    pub datadir: Option<String>,

    /// Base URL of the anchor proxy. `None` disables external anchoring.
    pub anchor_url: Option<String>,

    /// Identity key seed as 64 hex chars. `None` generates an ephemeral
    /// identity on startup.
    pub identity_seed_hex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Agents silent for longer than this are reaped.
    pub stale_threshold_ms: u64,
    /// Cadence of the reaper pass.
    pub reaper_interval_ms: u64,
    /// Expected heartbeat cadence, used to derive offline detection.
    pub heartbeat_interval_ms: u64,
    /// Re-queues before a task dead-letters as `max_retries_exceeded`.
    pub max_requeues: u32,
    /// Applied when a submitted task carries no timeout of its own.
    pub default_task_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: defaults::STALE_THRESHOLD_MS,
            reaper_interval_ms: defaults::REAPER_INTERVAL_MS,
            heartbeat_interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            max_requeues: defaults::MAX_REQUEUES,
            default_task_timeout_ms: defaults::DEFAULT_TASK_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub bootstrap_urls: Vec<String>,
    pub skew_window_ms: u64,
    pub replay_window_ms: u64,
    pub rate_limit_max: usize,
    pub rate_limit_window_ms: u64,
    pub dedup_cache_size: usize,
    pub fanout: usize,
    pub default_ttl: u32,
    pub claim_delay_ms: u64,
    pub peer_refresh_interval_ms: u64,
    pub max_missed_probes: u32,
    pub capability_interval_ms: u64,
    /// Summaries older than `capability_stale_factor * capability_interval_ms`
    /// are treated as stale.
    pub capability_stale_factor: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bootstrap_urls: Vec::new(),
            skew_window_ms: defaults::SKEW_WINDOW_MS,
            replay_window_ms: defaults::REPLAY_WINDOW_MS,
            rate_limit_max: defaults::RATE_LIMIT_MAX,
            rate_limit_window_ms: defaults::RATE_LIMIT_WINDOW_MS,
            dedup_cache_size: defaults::DEDUP_CACHE_SIZE,
            fanout: defaults::FANOUT,
            default_ttl: defaults::DEFAULT_TTL,
            claim_delay_ms: defaults::CLAIM_DELAY_MS,
            peer_refresh_interval_ms: defaults::PEER_REFRESH_INTERVAL_MS,
            max_missed_probes: defaults::MAX_MISSED_PROBES,
            capability_interval_ms: defaults::CAPABILITY_INTERVAL_MS,
            capability_stale_factor: defaults::CAPABILITY_STALE_FACTOR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub base_price_sats: f64,
    pub alpha: f64,
    pub beta: f64,
    pub min_price_sats: f64,
    pub max_price_sats: f64,
    /// Proposals older than this are dropped from the consensus window.
    pub proposal_window_ms: u64,
    /// Credits earned per cpu-second before the model quality multiplier.
    pub base_rate_per_cpu_second: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_price_sats: defaults::BASE_PRICE_SATS,
            alpha: defaults::PRICE_ALPHA,
            beta: defaults::PRICE_BETA,
            min_price_sats: defaults::MIN_PRICE_SATS,
            max_price_sats: defaults::MAX_PRICE_SATS,
            proposal_window_ms: defaults::PROPOSAL_WINDOW_MS,
            base_rate_per_cpu_second: defaults::BASE_RATE_PER_CPU_SECOND,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Cadence of `ordering_snapshot` head publication.
    pub snapshot_interval_ms: u64,
    /// Length of one issuance epoch window.
    pub issuance_window_ms: u64,
    /// How long proposals collect votes before an epoch stalls.
    pub voting_window_ms: u64,
    /// Entries inspected when checking two heads for a common ancestor.
    pub divergence_lookback: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: defaults::SNAPSHOT_INTERVAL_MS,
            issuance_window_ms: defaults::ISSUANCE_WINDOW_MS,
            voting_window_ms: defaults::VOTING_WINDOW_MS,
            divergence_lookback: defaults::DIVERGENCE_LOOKBACK,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub mtu: usize,
    pub reassembly_timeout_ms: u64,
    pub peer_stale_ms: u64,
    /// Routing rejects peers whose cost reaches this bound.
    pub max_cost: f64,
    pub offline_after_missed_heartbeats: u32,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            mtu: defaults::BLE_MTU,
            reassembly_timeout_ms: defaults::REASSEMBLY_TIMEOUT_MS,
            peer_stale_ms: defaults::BLE_PEER_STALE_MS,
            max_cost: defaults::BLE_MAX_COST,
            offline_after_missed_heartbeats: defaults::OFFLINE_AFTER_MISSED_HEARTBEATS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub listen_addr: String,
    /// Shared bearer token required on every protected method.
    pub mesh_auth_token: Option<String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen_addr: defaults::RPC_LISTEN_ADDR.to_owned(),
            mesh_auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the local Ollama-compatible backend.
    pub ollama_host: Option<String>,
    /// Model to advertise as active.
    pub ollama_model: Option<String>,
}

impl NodeConfig {
    /// Loads from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => toml::from_str(&fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides through a lookup function.
    ///
    /// Recognized: `MESH_AUTH_TOKEN`, `COORDINATOR_BOOTSTRAP_URLS`
    /// (comma-separated), `OLLAMA_HOST`, `OLLAMA_MODEL`, `DATABASE_URL`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("MESH_AUTH_TOKEN") {
            self.rpc.mesh_auth_token = Some(token);
        }
        if let Some(urls) = lookup("COORDINATOR_BOOTSTRAP_URLS") {
            self.gossip.bootstrap_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(host) = lookup("OLLAMA_HOST") {
            self.model.ollama_host = Some(host);
        }
        if let Some(model) = lookup("OLLAMA_MODEL") {
            self.model.ollama_model = Some(model);
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.datadir = Some(url);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pricing.min_price_sats > self.pricing.max_price_sats {
            return Err(ConfigError::Invalid(
                "pricing.min_price_sats exceeds max_price_sats".into(),
            ));
        }
        if self.ble.mtu <= 4 {
            return Err(ConfigError::Invalid(
                "ble.mtu must exceed the 4-byte chunk header".into(),
            ));
        }
        if let Some(seed) = &self.identity_seed_hex {
            if seed.len() != 64 {
                return Err(ConfigError::Invalid(
                    "identity_seed_hex must be 64 hex chars".into(),
                ));
            }
        }
        Ok(())
    }
}
