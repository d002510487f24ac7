//! The agent registry.

use std::collections::HashMap;

use edgecoder_db::AgentRecord;
use edgecoder_mesh_types::{AgentCapability, PowerTelemetry};
use edgecoder_primitives::{AccountId, AgentId, Buf32};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::CoordinatorError;

/// Fields a heartbeat may refresh.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatUpdate {
    pub power: Option<PowerTelemetry>,
    pub active_model: Option<String>,
    pub active_model_param_size: Option<f64>,
    pub model_swap_in_progress: Option<bool>,
    pub current_load: Option<u32>,
    pub connected_peers: Option<u32>,
}

/// Exclusive owner of the coordinator's agent map.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an agent, overwriting any prior record with the same id.
    pub fn register(&self, capability: AgentCapability, now_ms: u64) -> AgentId {
        let agent_id = capability.agent_id.clone();
        let record = AgentRecord {
            capability,
            last_seen_ms: now_ms,
            connected_peers: 0,
        };
        let replaced = self
            .agents
            .write()
            .insert(agent_id.clone(), record)
            .is_some();
        info!(agent = %agent_id, replaced, "agent registered");
        agent_id
    }

    /// Applies a heartbeat. `last_seen_ms` never moves backwards, so a
    /// delayed older heartbeat cannot shadow a newer one.
    pub fn heartbeat(
        &self,
        agent_id: &AgentId,
        update: HeartbeatUpdate,
        now_ms: u64,
    ) -> Result<(), CoordinatorError> {
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordinatorError::UnknownAgent(agent_id.clone()))?;

        record.last_seen_ms = record.last_seen_ms.max(now_ms);
        if let Some(power) = update.power {
            record.capability.power = power;
        }
        if let Some(model) = update.active_model {
            record.capability.active_model = Some(model);
        }
        if let Some(size) = update.active_model_param_size {
            record.capability.active_model_param_size = size;
        }
        if let Some(swapping) = update.model_swap_in_progress {
            record.capability.model_swap_in_progress = swapping;
        }
        if let Some(load) = update.current_load {
            record.capability.current_load = load;
        }
        if let Some(peers) = update.connected_peers {
            record.connected_peers = peers;
        }
        Ok(())
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<AgentRecord> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Capabilities of agents seen within the staleness threshold.
    pub fn live_capabilities(&self, now_ms: u64, stale_threshold_ms: u64) -> Vec<AgentCapability> {
        self.agents
            .read()
            .values()
            .filter(|r| now_ms.saturating_sub(r.last_seen_ms) <= stale_threshold_ms)
            .map(|r| r.capability.clone())
            .collect()
    }

    /// Removes agents unseen past the threshold, returning their records
    /// so in-flight work can be re-queued.
    pub fn reap(&self, now_ms: u64, stale_threshold_ms: u64) -> Vec<AgentRecord> {
        let mut agents = self.agents.write();
        let stale: Vec<AgentId> = agents
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.last_seen_ms) > stale_threshold_ms)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                debug!(agent = %id, "reaping stale agent");
                agents.remove(&id)
            })
            .collect()
    }

    /// Public key pinned at registration, by agent id.
    pub fn agent_key(&self, agent_id: &AgentId) -> Option<Buf32> {
        self.agents
            .read()
            .get(agent_id)
            .map(|r| r.capability.public_key)
    }

    /// Public key by account id, for settling offline batches.
    pub fn account_key(&self, account_id: &AccountId) -> Option<Buf32> {
        self.agents
            .read()
            .values()
            .find(|r| &r.capability.account_id == account_id)
            .map(|r| r.capability.public_key)
    }

    /// `(total concurrent capacity, idle fraction)` across live agents,
    /// feeding the dynamic pricer.
    pub fn load_figures(&self, now_ms: u64, stale_threshold_ms: u64) -> (u64, f64) {
        let agents = self.agents.read();
        let live: Vec<_> = agents
            .values()
            .filter(|r| now_ms.saturating_sub(r.last_seen_ms) <= stale_threshold_ms)
            .collect();
        if live.is_empty() {
            return (0, 0.0);
        }
        let capacity: u64 = live
            .iter()
            .map(|r| r.capability.max_concurrent_tasks as u64)
            .sum();
        let idle = live
            .iter()
            .filter(|r| r.capability.current_load == 0 && !r.capability.model_swap_in_progress)
            .count();
        (capacity, idle as f64 / live.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use edgecoder_mesh_types::{AgentMode, ClientType, ResourceClass};

    use super::*;

    pub(crate) fn capability(id: &str, param_size: f64) -> AgentCapability {
        AgentCapability {
            agent_id: AgentId::new(id),
            account_id: AccountId::new(format!("acct-{id}")),
            public_key: Buf32::zero(),
            os: "linux".into(),
            version: "0.1.0".into(),
            client_type: ClientType::Headless,
            mode: AgentMode::SwarmOnly,
            resource_classes: vec![ResourceClass::Cpu],
            local_models: vec!["qwen:7b".into()],
            active_model: Some("qwen:7b".into()),
            active_model_param_size: param_size,
            model_swap_in_progress: false,
            max_concurrent_tasks: 2,
            current_load: 0,
            power: PowerTelemetry::default(),
        }
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = AgentRegistry::new();
        registry.register(capability("a1", 7.0), 100);
        registry.register(capability("a1", 3.0), 200);
        assert_eq!(registry.len(), 1);
        let record = registry.get(&AgentId::new("a1")).unwrap();
        assert_eq!(record.capability.active_model_param_size, 3.0);
    }

    #[test]
    fn heartbeat_requires_registration() {
        let registry = AgentRegistry::new();
        let err = registry.heartbeat(&AgentId::new("ghost"), HeartbeatUpdate::default(), 100);
        assert!(matches!(err, Err(CoordinatorError::UnknownAgent(_))));
    }

    #[test]
    fn last_seen_is_monotonic() {
        let registry = AgentRegistry::new();
        registry.register(capability("a1", 7.0), 100);
        registry
            .heartbeat(&AgentId::new("a1"), HeartbeatUpdate::default(), 500)
            .unwrap();
        // an older heartbeat arriving late must not rewind last_seen
        registry
            .heartbeat(&AgentId::new("a1"), HeartbeatUpdate::default(), 300)
            .unwrap();
        assert_eq!(registry.get(&AgentId::new("a1")).unwrap().last_seen_ms, 500);
    }

    #[test]
    fn live_capabilities_respect_threshold() {
        let registry = AgentRegistry::new();
        registry.register(capability("fresh", 7.0), 100_000);
        registry.register(capability("stale", 7.0), 0);

        let live = registry.live_capabilities(120_000, 120_000);
        assert_eq!(live.len(), 2);
        let live = registry.live_capabilities(121_000, 120_000);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].agent_id, AgentId::new("fresh"));
    }

    #[test]
    fn reap_removes_and_returns_stale() {
        let registry = AgentRegistry::new();
        registry.register(capability("a9", 7.0), 0);
        registry.register(capability("fresh", 7.0), 100_000);

        // 125 s after a9's last heartbeat
        let reaped = registry.reap(125_000, 120_000);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].capability.agent_id, AgentId::new("a9"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn load_figures_count_idle_agents() {
        let registry = AgentRegistry::new();
        let mut busy = capability("busy", 7.0);
        busy.current_load = 2;
        registry.register(busy, 1_000);
        registry.register(capability("idle", 7.0), 1_000);

        let (capacity, idle_fraction) = registry.load_figures(1_000, 120_000);
        assert_eq!(capacity, 4);
        assert!((idle_fraction - 0.5).abs() < 1e-9);
    }
}
