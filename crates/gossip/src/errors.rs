use edgecoder_mesh_types::ProtocolError;
use thiserror::Error;

/// Why the receive pipeline refused a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("sender is blacklisted")]
    Blacklisted,

    #[error("timestamp outside skew window")]
    SkewExceeded,

    #[error("replay")]
    Replay,

    #[error("rate_limited")]
    RateLimited,

    #[error("signature verification failed")]
    BadSignature,

    #[error("sender key differs from pinned identity")]
    IdentityMismatch,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Gossip transport and protocol failures.
#[derive(Debug, Error)]
pub enum GossipError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("peer delivery failed: {0}")]
    Delivery(String),

    #[error("peer unreachable: {0}")]
    Unreachable(String),
}
