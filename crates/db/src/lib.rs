//! Persistence layer.
//!
//! The store trait family covers every durable entity: agents, tasks,
//! credit accounts, credit transactions, ordering entries, and payment
//! intents. Two implementations ship: a `parking_lot`-locked in-memory
//! store for tests and ephemeral nodes, and a sled-backed store for real
//! deployments. Ordering appends are serialised under a single lock so
//! sequence numbers never gap.

mod errors;
mod memory;
mod sleddb;
mod traits;
mod types;

pub use errors::DbError;
pub use memory::MemoryStore;
pub use sleddb::SledStore;
pub use traits::{
    AccountStore, AgentStore, IntentStore, OrderingStore, PersistentStore, TaskStore,
    TransactionStore,
};
#[cfg(feature = "test-utils")]
pub use traits::{
    MockAccountStore, MockAgentStore, MockIntentStore, MockOrderingStore, MockTaskStore,
    MockTransactionStore,
};
pub use types::{
    compute_event_hash, verify_chain_link, AgentRecord, CreditAccount, IntentState,
    OrderingEntry, OrderingEventType, PaymentIntent, TaskRecord, TaskResult, TaskStatus,
    ORDERING_GENESIS,
};
