//! Node configuration.
//!
//! Config resolves in three layers: built-in defaults, an optional TOML
//! file, then environment overrides. Every tunable the protocol names is a
//! field here so deployments can adjust them without rebuilding.

mod config;
mod defaults;

pub use config::{
    BleConfig, ConfigError, CoordinatorConfig, GossipConfig, LedgerConfig, ModelConfig,
    NodeConfig, PricingConfig, RpcConfig,
};
