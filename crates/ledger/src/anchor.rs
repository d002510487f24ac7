//! External anchoring boundary.

use async_trait::async_trait;
use edgecoder_primitives::Buf32;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("anchor endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("anchor rejected checkpoint: {0}")]
    Rejected(String),
}

/// State of a previously submitted checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorStatus {
    Pending,
    Confirmed,
    Unknown,
}

/// Submits checkpoint hashes to an external anchor (e.g. a Bitcoin
/// `OP_RETURN` proxy). `submit` must be idempotent on the checkpoint hash:
/// re-submitting a hash returns the existing reference.
#[async_trait]
pub trait AnchorAdapter: Send + Sync {
    async fn submit(&self, checkpoint_hash: Buf32) -> Result<String, AnchorError>;
    async fn lookup(&self, anchor_ref: &str) -> Result<AnchorStatus, AnchorError>;
}

/// No-op anchor for nodes running without an anchor proxy. Checkpoints are
/// acknowledged locally and never leave the process.
#[derive(Debug, Default)]
pub struct NullAnchor;

#[async_trait]
impl AnchorAdapter for NullAnchor {
    async fn submit(&self, checkpoint_hash: Buf32) -> Result<String, AnchorError> {
        Ok(format!("null:{checkpoint_hash}"))
    }

    async fn lookup(&self, _anchor_ref: &str) -> Result<AnchorStatus, AnchorError> {
        Ok(AnchorStatus::Confirmed)
    }
}
