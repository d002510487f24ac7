//! Typed payloads carried by mesh envelopes.

use std::collections::BTreeMap;

use edgecoder_primitives::{AccountId, AgentId, Buf32, CoordinatorId, EpochId, TaskId};
use serde::{Deserialize, Serialize};

use crate::{
    CreditTransaction, MessageKind, ModelCapability, ProtocolError, ResourceClass, SignedBid,
    TaskResultStatus, TaskSpec,
};

/// Liveness state advertised in a `peer_announce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Active,
    Stale,
    Leaving,
}

/// One reachable peer, as shared during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: AgentId,
    pub rpc_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnounce {
    pub rpc_url: String,
    pub status: PeerStatus,
    /// When set, the announcement concerns this node rather than the
    /// sender (e.g. a coordinator reporting a reaped agent as stale).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<AgentId>,
    /// Peers the announcer already knows, for transitive discovery.
    #[serde(default)]
    pub known_peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub coordinator_id: CoordinatorId,
    pub queued_tasks: u64,
    pub active_agents: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOffer {
    pub task: TaskSpec,
    /// The requester's signed bid, carried so the eventual provider can
    /// assemble a dual-signed credit transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<SignedBid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskClaim {
    pub task_id: TaskId,
    pub claimant: AgentId,
    /// Expected execution cost under the routing formula; lowest wins.
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRejected {
    pub task_id: TaskId,
    pub claimant: AgentId,
    pub winner: AgentId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultAnnounce {
    pub task_id: TaskId,
    pub provider: AgentId,
    pub status: TaskResultStatus,
    pub cpu_seconds: f64,
    #[serde(default)]
    pub output: String,
    /// Present when the result settles credits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<CreditTransaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderingSnapshot {
    pub coordinator_id: CoordinatorId,
    pub head_hash: Buf32,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistUpdate {
    pub blacklisted: Vec<AgentId>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuanceProposal {
    pub epoch: EpochId,
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    /// Proposed per-account earnings for the window.
    pub earnings: BTreeMap<AccountId, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuanceVote {
    pub epoch: EpochId,
    /// Coordinator whose proposal this vote judges.
    pub proposer: CoordinatorId,
    pub approve: bool,
    /// Counter-proposal when the voter's own view disagrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<BTreeMap<AccountId, f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuanceCommit {
    pub epoch: EpochId,
    pub earnings: BTreeMap<AccountId, f64>,
    pub approvals: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuanceCheckpoint {
    pub epoch: EpochId,
    pub head_hash: Buf32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySummary {
    pub coordinator_id: CoordinatorId,
    pub agent_count: u64,
    /// Per-model aggregates keyed by model name.
    pub models: BTreeMap<String, ModelCapability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskForward {
    pub task: TaskSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<SignedBid>,
    /// Coordinator that originated the forward and receives the result.
    pub origin_coordinator: CoordinatorId,
    pub origin_account: AccountId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceProposal {
    pub coordinator_id: CoordinatorId,
    pub resource_class: ResourceClass,
    pub price_per_compute_unit_sats: f64,
}

/// The tagged union of everything a mesh envelope can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshPayload {
    PeerAnnounce(PeerAnnounce),
    QueueSummary(QueueSummary),
    TaskOffer(TaskOffer),
    TaskClaim(TaskClaim),
    ClaimRejected(ClaimRejected),
    ResultAnnounce(ResultAnnounce),
    OrderingSnapshot(OrderingSnapshot),
    BlacklistUpdate(BlacklistUpdate),
    IssuanceProposal(IssuanceProposal),
    IssuanceVote(IssuanceVote),
    IssuanceCommit(IssuanceCommit),
    IssuanceCheckpoint(IssuanceCheckpoint),
    CapabilitySummary(CapabilitySummary),
    TaskForward(TaskForward),
    PriceProposal(PriceProposal),
}

impl MeshPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::PeerAnnounce(_) => MessageKind::PeerAnnounce,
            Self::QueueSummary(_) => MessageKind::QueueSummary,
            Self::TaskOffer(_) => MessageKind::TaskOffer,
            Self::TaskClaim(_) => MessageKind::TaskClaim,
            Self::ClaimRejected(_) => MessageKind::ClaimRejected,
            Self::ResultAnnounce(_) => MessageKind::ResultAnnounce,
            Self::OrderingSnapshot(_) => MessageKind::OrderingSnapshot,
            Self::BlacklistUpdate(_) => MessageKind::BlacklistUpdate,
            Self::IssuanceProposal(_) => MessageKind::IssuanceProposal,
            Self::IssuanceVote(_) => MessageKind::IssuanceVote,
            Self::IssuanceCommit(_) => MessageKind::IssuanceCommit,
            Self::IssuanceCheckpoint(_) => MessageKind::IssuanceCheckpoint,
            Self::CapabilitySummary(_) => MessageKind::CapabilitySummary,
            Self::TaskForward(_) => MessageKind::TaskForward,
            Self::PriceProposal(_) => MessageKind::PriceProposal,
        }
    }

    /// Parses a payload value according to its envelope `type` tag.
    pub fn from_value(
        kind: MessageKind,
        value: serde_json::Value,
    ) -> Result<Self, ProtocolError> {
        fn parse<T: serde::de::DeserializeOwned>(
            kind: MessageKind,
            value: serde_json::Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(value).map_err(|e| ProtocolError::MalformedPayload {
                kind: kind.as_str(),
                reason: e.to_string(),
            })
        }

        Ok(match kind {
            MessageKind::PeerAnnounce => Self::PeerAnnounce(parse(kind, value)?),
            MessageKind::QueueSummary => Self::QueueSummary(parse(kind, value)?),
            MessageKind::TaskOffer => Self::TaskOffer(parse(kind, value)?),
            MessageKind::TaskClaim => Self::TaskClaim(parse(kind, value)?),
            MessageKind::ClaimRejected => Self::ClaimRejected(parse(kind, value)?),
            MessageKind::ResultAnnounce => Self::ResultAnnounce(parse(kind, value)?),
            MessageKind::OrderingSnapshot => Self::OrderingSnapshot(parse(kind, value)?),
            MessageKind::BlacklistUpdate => Self::BlacklistUpdate(parse(kind, value)?),
            MessageKind::IssuanceProposal => Self::IssuanceProposal(parse(kind, value)?),
            MessageKind::IssuanceVote => Self::IssuanceVote(parse(kind, value)?),
            MessageKind::IssuanceCommit => Self::IssuanceCommit(parse(kind, value)?),
            MessageKind::IssuanceCheckpoint => Self::IssuanceCheckpoint(parse(kind, value)?),
            MessageKind::CapabilitySummary => Self::CapabilitySummary(parse(kind, value)?),
            MessageKind::TaskForward => Self::TaskForward(parse(kind, value)?),
            MessageKind::PriceProposal => Self::PriceProposal(parse(kind, value)?),
        })
    }

    /// Type-specific invariant checks, the final step of the receive
    /// pipeline.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let fail = |reason: &str| Err(ProtocolError::InvalidPayload(reason.to_owned()));
        match self {
            Self::PeerAnnounce(p) => {
                if p.rpc_url.is_empty() && p.subject.is_none() {
                    return fail("peer_announce.rpc_url empty");
                }
            }
            Self::TaskOffer(p) => {
                if p.task.required_model_size < 0.0 || !p.task.required_model_size.is_finite() {
                    return fail("task_offer.required_model_size negative");
                }
                if p.task.timeout_ms == 0 {
                    return fail("task_offer.timeout_ms zero");
                }
            }
            Self::TaskClaim(p) => {
                if !p.cost.is_finite() || p.cost < 0.0 {
                    return fail("task_claim.cost invalid");
                }
            }
            Self::ResultAnnounce(p) => {
                if p.cpu_seconds < 0.0 || !p.cpu_seconds.is_finite() {
                    return fail("result_announce.cpu_seconds invalid");
                }
                if let Some(tx) = &p.transaction {
                    if tx.credits < 0.0 || !tx.credits.is_finite() {
                        return fail("result_announce.transaction.credits negative");
                    }
                }
            }
            Self::IssuanceProposal(p) => {
                if p.window_end_ms <= p.window_start_ms {
                    return fail("issuance_proposal window inverted");
                }
                if p.earnings.values().any(|v| *v < 0.0 || !v.is_finite()) {
                    return fail("issuance_proposal earnings negative");
                }
            }
            Self::IssuanceCommit(p) => {
                if p.earnings.values().any(|v| *v < 0.0 || !v.is_finite()) {
                    return fail("issuance_commit earnings negative");
                }
            }
            Self::CapabilitySummary(p) => {
                for (model, cap) in &p.models {
                    if cap.total_param_capacity < 0.0 || cap.avg_load < 0.0 {
                        return Err(ProtocolError::InvalidPayload(format!(
                            "capability_summary model `{model}` negative aggregate"
                        )));
                    }
                }
            }
            Self::PriceProposal(p) => {
                if !p.price_per_compute_unit_sats.is_finite()
                    || p.price_per_compute_unit_sats < 0.0
                {
                    return fail("price_proposal price invalid");
                }
            }
            Self::TaskForward(p) => {
                if p.task.timeout_ms == 0 {
                    return fail("task_forward.timeout_ms zero");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl Serialize for MeshPayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::PeerAnnounce(p) => p.serialize(serializer),
            Self::QueueSummary(p) => p.serialize(serializer),
            Self::TaskOffer(p) => p.serialize(serializer),
            Self::TaskClaim(p) => p.serialize(serializer),
            Self::ClaimRejected(p) => p.serialize(serializer),
            Self::ResultAnnounce(p) => p.serialize(serializer),
            Self::OrderingSnapshot(p) => p.serialize(serializer),
            Self::BlacklistUpdate(p) => p.serialize(serializer),
            Self::IssuanceProposal(p) => p.serialize(serializer),
            Self::IssuanceVote(p) => p.serialize(serializer),
            Self::IssuanceCommit(p) => p.serialize(serializer),
            Self::IssuanceCheckpoint(p) => p.serialize(serializer),
            Self::CapabilitySummary(p) => p.serialize(serializer),
            Self::TaskForward(p) => p.serialize(serializer),
            Self::PriceProposal(p) => p.serialize(serializer),
        }
    }
}
