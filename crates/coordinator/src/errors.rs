use edgecoder_db::{DbError, TaskStatus};
use edgecoder_ledger::LedgerError;
use edgecoder_primitives::{AgentId, TaskId};
use thiserror::Error;

/// Coordinator-level failures, mapped onto the protocol error taxonomy by
/// the RPC layer.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Heartbeat or pull from an agent that never registered.
    #[error("unknown_agent: {0}")]
    UnknownAgent(AgentId),

    #[error("unknown_task: {0}")]
    UnknownTask(TaskId),

    /// Result reported by an agent that does not hold the claim.
    #[error("not_claimer: task {task} is claimed by {claimer}, not {reporter}")]
    NotClaimer {
        task: TaskId,
        claimer: String,
        reporter: AgentId,
    },

    /// The task state machine forbids this transition.
    #[error("invalid transition for {task}: {from:?} -> {to:?}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Registration or result signature failed verification.
    #[error("signature verification failed")]
    BadSignature,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
