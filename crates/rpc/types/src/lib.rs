//! Wire types for the coordinator RPC surface.

use edgecoder_db::{OrderingEntry, TaskStatus};
use edgecoder_mesh_types::{
    AgentCapability, CreditTransaction, PeerInfo, PowerTelemetry, ProjectMeta, SignedBid,
    TaskSpec,
};
use edgecoder_primitives::{AccountId, AgentId, Buf64, CoordinatorId, TaskId, TxId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub capability: AgentCapability,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub ok: bool,
    pub agent_id: AgentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerTelemetry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_model_param_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_swap_in_progress: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_load: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_peers: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Assigned by the coordinator when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub kind: String,
    pub language: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
    #[serde(default)]
    pub project: ProjectMeta,
    pub required_model_size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_account: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<SignedBid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub agent_id: AgentId,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub output: String,
    pub cpu_seconds: f64,
    pub tx_id: TxId,
    /// Provider signature over the settlement bytes.
    pub signature: Buf64,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub coordinator_id: CoordinatorId,
    pub agent_count: usize,
    pub queued_tasks: u64,
    pub claimed_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub expired_tasks: u64,
    pub cpu_price_sats: f64,
    pub gpu_price_sats: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_head: Option<(u64, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityResponse {
    pub agents: Vec<AgentCapability>,
}

/// Reply to a mesh ingest. For `peer_announce` messages the responder
/// introduces itself and shares its peer list, closing the discovery loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshIngestResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<PeerInfo>,
    #[serde(default)]
    pub known_peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshPeersResponse {
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedCoordinator {
    pub coordinator_id: CoordinatorId,
    pub total_param_capacity: f64,
    pub avg_load: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshCapabilitiesResponse {
    pub coordinators: Vec<FederatedCoordinator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSyncRequest {
    pub transactions: Vec<CreditTransaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSyncResponse {
    pub applied: Vec<TxId>,
    pub skipped: Vec<TxId>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRangeResponse {
    pub entries: Vec<OrderingEntry>,
}

impl EnqueueRequest {
    /// Materialises the task spec, minting an id and applying the default
    /// timeout where the submitter left them out.
    pub fn into_spec(self, default_timeout_ms: u64) -> (TaskSpec, Option<SignedBid>) {
        let spec = TaskSpec {
            task_id: self.task_id.unwrap_or_else(TaskId::generate),
            kind: self.kind,
            language: self.language,
            input: self.input,
            timeout_ms: self.timeout_ms.unwrap_or(default_timeout_ms),
            snapshot_ref: self.snapshot_ref,
            project: self.project,
            required_model_size: self.required_model_size,
            requester_account: self.requester_account,
        };
        (spec, self.bid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_defaults_apply() {
        let request: EnqueueRequest = serde_json::from_str(
            r#"{"kind":"code","language":"python","input":"print(1)","required_model_size":1.5}"#,
        )
        .unwrap();
        let (spec, bid) = request.into_spec(60_000);
        assert!(!spec.task_id.as_str().is_empty());
        assert_eq!(spec.timeout_ms, 60_000);
        assert_eq!(spec.project.project_id, "default");
        assert!(bid.is_none());
    }

    #[test]
    fn explicit_task_id_survives() {
        let request: EnqueueRequest = serde_json::from_str(
            r#"{"task_id":"t1","kind":"code","language":"python","input":"x","required_model_size":1.5,"timeout_ms":5000}"#,
        )
        .unwrap();
        let (spec, _) = request.into_spec(60_000);
        assert_eq!(spec.task_id, TaskId::new("t1"));
        assert_eq!(spec.timeout_ms, 5_000);
    }
}
