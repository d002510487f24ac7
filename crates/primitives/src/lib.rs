//! Core primitive types shared across the EdgeCoder workspace.
//!
//! Identifiers are thin newtypes over their wire representation so that
//! maps keyed by them cannot be accidentally crossed, and byte buffers
//! carry their own hex serialization.

mod buf;
mod hash;
mod id;
mod time;

pub use buf::{Buf32, Buf64};
pub use hash::{sha256, sha256_concat};
pub use id::{AccountId, AgentId, CoordinatorId, EpochId, MessageId, TaskId, TxId};
pub use time::now_millis;
