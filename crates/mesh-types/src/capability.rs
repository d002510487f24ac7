//! Agent capability and telemetry types.

use edgecoder_primitives::{AccountId, AgentId, Buf32};
use serde::{Deserialize, Serialize};

use crate::ResourceClass;

/// How the agent participates in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    /// Contributes compute only.
    SwarmOnly,
    /// Also drives an interactive IDE session.
    IdeEnabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Desktop,
    Mobile,
    Headless,
}

/// Power state reported with each heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerTelemetry {
    pub on_external_power: bool,
    pub battery_pct: u8,
    pub low_power_mode: bool,
    pub updated_at_ms: u64,
}

impl Default for PowerTelemetry {
    fn default() -> Self {
        Self {
            on_external_power: true,
            battery_pct: 100,
            low_power_mode: false,
            updated_at_ms: 0,
        }
    }
}

/// Everything a coordinator knows about one registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    pub agent_id: AgentId,
    pub account_id: AccountId,
    pub public_key: Buf32,
    pub os: String,
    pub version: String,
    pub client_type: ClientType,
    pub mode: AgentMode,
    /// Hardware classes this agent can serve.
    #[serde(default = "default_resource_classes")]
    pub resource_classes: Vec<ResourceClass>,
    /// Models present in the local catalog.
    pub local_models: Vec<String>,
    pub active_model: Option<String>,
    /// Parameter size of the active model, in billions.
    pub active_model_param_size: f64,
    pub model_swap_in_progress: bool,
    pub max_concurrent_tasks: u32,
    pub current_load: u32,
    #[serde(default)]
    pub power: PowerTelemetry,
}

fn default_resource_classes() -> Vec<ResourceClass> {
    vec![ResourceClass::Cpu]
}

impl AgentCapability {
    /// Whether the agent can serve tasks of this hardware class.
    pub fn serves_class(&self, class: ResourceClass) -> bool {
        self.resource_classes.contains(&class)
    }

    /// Load figure for advertisements: the unavailable sentinel `-1` while
    /// a model swap is in progress.
    pub fn advertised_load(&self) -> i32 {
        if self.model_swap_in_progress {
            -1
        } else {
            self.current_load as i32
        }
    }

    pub fn has_capacity(&self) -> bool {
        !self.model_swap_in_progress && self.current_load < self.max_concurrent_tasks
    }
}

/// Aggregate over all agents serving one model, as gossiped in
/// `capability_summary` messages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelCapability {
    pub agent_count: u64,
    /// Sum of parameter sizes across agents, in billions.
    pub total_param_capacity: f64,
    pub avg_load: f64,
}
