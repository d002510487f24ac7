//! Credit engine and ordering ledger.
//!
//! The credit engine maintains per-account balances and settles dual-signed
//! transactions; every settlement is committed into the per-coordinator
//! hash-linked ordering log. Issuance epochs distribute window earnings
//! under quorum approval, and committed heads are checkpointed through the
//! anchor adapter.

mod anchor;
mod chain;
mod engine;
mod errors;
mod issuance;

pub use anchor::{AnchorAdapter, AnchorError, AnchorStatus, NullAnchor};
pub use chain::{OrderingLog, RemoteHeadStatus};
pub use engine::{BleSyncReport, CreditEngine, RecordOutcome};
pub use errors::LedgerError;
pub use issuance::{EpochStatus, IssuanceManager, IssuanceOutcome};
