//! The peer table.

use std::collections::HashMap;

use edgecoder_mesh_types::PeerInfo;
use edgecoder_primitives::AgentId;
use parking_lot::RwLock;
use tracing::{debug, info};

/// One known peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry {
    pub node_id: AgentId,
    pub rpc_url: String,
    /// Learned from a direct announce rather than transitively; direct
    /// peers are preferred when fan-out is capped.
    pub direct: bool,
    pub last_seen_ms: u64,
    pub missed_probes: u32,
}

/// Reader-writer-locked peer map: reads during forwarding, writes on
/// join/leave and probe results.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<AgentId, PeerEntry>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a peer. A direct sighting upgrades a
    /// transitively learned entry and clears its probe strikes.
    pub fn upsert(&self, node_id: AgentId, rpc_url: String, direct: bool, now_ms: u64) {
        let mut peers = self.peers.write();
        peers
            .entry(node_id.clone())
            .and_modify(|entry| {
                entry.rpc_url = rpc_url.clone();
                entry.direct |= direct;
                entry.last_seen_ms = now_ms;
                entry.missed_probes = 0;
            })
            .or_insert_with(|| {
                debug!(peer = %node_id, direct, "new peer");
                PeerEntry {
                    node_id,
                    rpc_url,
                    direct,
                    last_seen_ms: now_ms,
                    missed_probes: 0,
                }
            });
    }

    /// Merges a peer list shared by another node.
    pub fn merge_known_peers(&self, source: &AgentId, peers: &[PeerInfo], now_ms: u64) {
        for info in peers {
            if &info.node_id == source {
                continue;
            }
            if !self.peers.read().contains_key(&info.node_id) {
                self.upsert(info.node_id.clone(), info.rpc_url.clone(), false, now_ms);
            }
        }
    }

    pub fn mark_alive(&self, node_id: &AgentId, now_ms: u64) {
        if let Some(entry) = self.peers.write().get_mut(node_id) {
            entry.last_seen_ms = now_ms;
            entry.missed_probes = 0;
        }
    }

    /// Records a failed probe. The peer is evicted after `max_missed`
    /// consecutive failures; returns `true` when that happens.
    pub fn mark_probe_failure(&self, node_id: &AgentId, max_missed: u32) -> bool {
        let mut peers = self.peers.write();
        let Some(entry) = peers.get_mut(node_id) else {
            return false;
        };
        entry.missed_probes += 1;
        if entry.missed_probes >= max_missed {
            peers.remove(node_id);
            info!(peer = %node_id, "peer evicted after missed probes");
            return true;
        }
        false
    }

    pub fn remove(&self, node_id: &AgentId) {
        self.peers.write().remove(node_id);
    }

    pub fn get(&self, node_id: &AgentId) -> Option<PeerEntry> {
        self.peers.read().get(node_id).cloned()
    }

    pub fn list(&self) -> Vec<PeerEntry> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Relay targets: everyone but `exclude`, direct peers first, capped
    /// at `fanout`. Ordering within a tier is by node id so relay sets are
    /// deterministic.
    pub fn fanout_peers(&self, exclude: &AgentId, fanout: usize) -> Vec<PeerEntry> {
        let peers = self.peers.read();
        let mut candidates: Vec<&PeerEntry> = peers
            .values()
            .filter(|entry| &entry.node_id != exclude)
            .collect();
        candidates.sort_by(|a, b| {
            b.direct
                .cmp(&a.direct)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        candidates.into_iter().take(fanout).cloned().collect()
    }
}
