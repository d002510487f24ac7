//! Stored record types.

use edgecoder_mesh_types::{AgentCapability, SignedBid, TaskSpec};
use edgecoder_primitives::{AccountId, AgentId, Buf32, Buf64, TaskId};
use serde::{Deserialize, Serialize};

/// Previous-hash marker of the genesis ordering entry.
pub const ORDERING_GENESIS: &str = "ORDERING_GENESIS";

/// A registered agent plus its liveness bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub capability: AgentCapability,
    pub last_seen_ms: u64,
    pub connected_peers: u32,
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Offered,
    Claimed,
    Running,
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    /// Whether the state machine allows `self → next`.
    ///
    /// `Expired` is reachable from every non-terminal state via the
    /// deadline sweep; terminal states accept no transitions.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Queued, Offered) | (Queued, Claimed) => true,
            (Offered, Claimed) | (Offered, Queued) => true,
            (Claimed, Running) | (Claimed, Queued) | (Claimed, Completed) | (Claimed, Failed) => {
                true
            }
            (Running, Completed) | (Running, Failed) | (Running, Queued) => true,
            (Queued | Offered | Claimed | Running, Expired) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

/// Outcome attached to a terminal task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: String,
    pub cpu_seconds: f64,
    /// Signature by the claiming agent over the result bytes.
    pub provider_signature: Buf64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A task and its full execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub enqueued_at_ms: u64,
    pub claimed_by: Option<AgentId>,
    pub claimed_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub result: Option<TaskResult>,
    /// Times this task went back to the queue after a claim fell through.
    pub requeues: u32,
    /// Dead-letter or failure reason, if any.
    pub failure_reason: Option<String>,
}

impl TaskRecord {
    pub fn new(spec: TaskSpec, now_ms: u64) -> Self {
        Self {
            spec,
            status: TaskStatus::Queued,
            enqueued_at_ms: now_ms,
            claimed_by: None,
            claimed_at_ms: None,
            completed_at_ms: None,
            result: None,
            requeues: 0,
            failure_reason: None,
        }
    }
}

/// A credit balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditAccount {
    pub account_id: AccountId,
    pub balance: f64,
    pub updated_at_ms: u64,
}

impl CreditAccount {
    pub fn new(account_id: AccountId, now_ms: u64) -> Self {
        Self {
            account_id,
            balance: 0.0,
            updated_at_ms: now_ms,
        }
    }
}

/// What kind of event an ordering entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingEventType {
    CreditTransaction,
    IssuanceCommit,
    Checkpoint,
    Adjustment,
}

/// One entry of the hash-linked ordering chain.
///
/// `event_hash = SHA-256(prev_event_hash || payload_json || signer_id ||
/// ASCII(timestamp))`, with the genesis entry using [`ORDERING_GENESIS`]
/// as its previous hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderingEntry {
    pub sequence_number: u64,
    /// Hex hash of the previous entry, or [`ORDERING_GENESIS`].
    pub prev_event_hash: String,
    pub event_hash: Buf32,
    pub event_type: OrderingEventType,
    /// Canonical JSON of the event payload.
    pub payload_json: String,
    pub signer_id: AgentId,
    pub signature: Buf64,
    pub timestamp: u64,
}

/// Lifecycle of a requester's pre-committed payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentState {
    Pending,
    Settled,
    Voided,
}

/// A signed bid held until its task settles or expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub task_id: TaskId,
    pub bid: SignedBid,
    pub state: IntentState,
    pub created_at_ms: u64,
}

/// Computes the hash for an ordering entry from its constituents.
pub fn compute_event_hash(
    prev_event_hash: &str,
    payload_json: &str,
    signer_id: &AgentId,
    timestamp: u64,
) -> Buf32 {
    edgecoder_primitives::sha256_concat([
        prev_event_hash.as_bytes(),
        payload_json.as_bytes(),
        signer_id.as_str().as_bytes(),
        timestamp.to_string().as_bytes(),
    ])
}

/// Checks that `entry` validly extends `prev` (or starts the chain when
/// `prev` is `None`): contiguous sequence number, matching hash link, and a
/// correctly recomputed event hash.
pub fn verify_chain_link(
    prev: Option<&OrderingEntry>,
    entry: &OrderingEntry,
) -> Result<(), crate::DbError> {
    let expected_seq = prev.map(|p| p.sequence_number + 1).unwrap_or(0);
    if entry.sequence_number != expected_seq {
        return Err(crate::DbError::SequenceGap {
            expected: expected_seq,
            got: entry.sequence_number,
        });
    }

    let expected_prev = prev
        .map(|p| p.event_hash.to_hex())
        .unwrap_or_else(|| ORDERING_GENESIS.to_owned());
    if entry.prev_event_hash != expected_prev {
        return Err(crate::DbError::ChainMismatch {
            sequence: entry.sequence_number,
        });
    }

    let recomputed = compute_event_hash(
        &entry.prev_event_hash,
        &entry.payload_json,
        &entry.signer_id,
        entry.timestamp,
    );
    if recomputed != entry.event_hash {
        return Err(crate::DbError::ChainMismatch {
            sequence: entry.sequence_number,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Expired] {
            for next in [
                TaskStatus::Queued,
                TaskStatus::Claimed,
                TaskStatus::Running,
                TaskStatus::Completed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn claim_timeout_path_allowed() {
        assert!(TaskStatus::Claimed.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn expiry_reachable_from_live_states() {
        for live in [
            TaskStatus::Queued,
            TaskStatus::Offered,
            TaskStatus::Claimed,
            TaskStatus::Running,
        ] {
            assert!(live.can_transition_to(TaskStatus::Expired));
        }
    }

    #[test]
    fn event_hash_depends_on_all_parts() {
        let base = compute_event_hash("prev", "{}", &AgentId::new("a1"), 1);
        assert_ne!(base, compute_event_hash("prev2", "{}", &AgentId::new("a1"), 1));
        assert_ne!(base, compute_event_hash("prev", "{1}", &AgentId::new("a1"), 1));
        assert_ne!(base, compute_event_hash("prev", "{}", &AgentId::new("a2"), 1));
        assert_ne!(base, compute_event_hash("prev", "{}", &AgentId::new("a1"), 2));
    }
}
