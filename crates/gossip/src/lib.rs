//! Gossip mesh.
//!
//! Peers exchange signed envelopes over their coordinator RPC endpoints.
//! This crate owns the peer table, the receive pipeline that rejects
//! replayed, stale, over-limit, or mis-signed traffic, TTL-bounded
//! relaying with capped fan-out, and the task offer/claim race. Payload
//! consumption beyond that (results, summaries, ledger events) is handed
//! to the coordinator through an event channel.

mod claims;
mod errors;
mod mesh;
mod peer;
mod pipeline;

pub use claims::{ClaimCollector, ClaimOutcome, ClaimRecord};
pub use errors::{GossipError, RejectReason};
pub use mesh::{AnnounceResponse, GossipMesh, IngestOutcome, MeshEvent, PeerClient};
pub use peer::{PeerEntry, PeerTable};
pub use pipeline::{Admittance, ReceivePipeline};
