//! Wire types for the EdgeCoder mesh protocol.
//!
//! Everything peers exchange is defined here: the signed gossip envelope,
//! the tagged payload variants it carries, and the shared task, credit, and
//! capability objects those payloads embed. The envelope's signing bytes
//! use a fixed field order and compact JSON so every implementation signs
//! and verifies identical bytes.

mod capability;
mod credit;
mod envelope;
mod errors;
mod payload;
mod task;

pub use capability::{
    AgentCapability, AgentMode, ClientType, ModelCapability, PowerTelemetry,
};
pub use credit::{CreditReason, CreditTransaction, SignedBid};
pub use envelope::{MeshEnvelope, MessageKind};
pub use errors::ProtocolError;
pub use payload::{
    BlacklistUpdate, CapabilitySummary, ClaimRejected, IssuanceCheckpoint, IssuanceCommit,
    IssuanceProposal, IssuanceVote, MeshPayload, OrderingSnapshot, PeerAnnounce, PeerInfo,
    PeerStatus, PriceProposal, QueueSummary, ResultAnnounce, TaskClaim, TaskForward, TaskOffer,
};
pub use task::{ProjectMeta, ResourceClass, TaskResultStatus, TaskSpec};
