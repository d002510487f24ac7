//! Store trait family.
//!
//! Each entity gets its own narrow trait; [`PersistentStore`] bundles them
//! for components that need the whole surface. Implementations must be
//! safe to share across tasks (`Send + Sync`). The `test-utils` feature
//! exposes a mockall mock per trait for consumers' tests.

use async_trait::async_trait;
use edgecoder_mesh_types::CreditTransaction;
use edgecoder_primitives::{AccountId, AgentId, TaskId, TxId};

use crate::{
    AgentRecord, CreditAccount, DbError, IntentState, OrderingEntry, PaymentIntent, TaskRecord,
};

#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Inserts or overwrites the record for its agent id.
    async fn put_agent(&self, record: AgentRecord) -> Result<(), DbError>;
    async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<AgentRecord>, DbError>;
    async fn remove_agent(&self, agent_id: &AgentId) -> Result<(), DbError>;
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, DbError>;
}

#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn put_task(&self, record: TaskRecord) -> Result<(), DbError>;
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, DbError>;
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, DbError>;
    async fn remove_task(&self, task_id: &TaskId) -> Result<(), DbError>;
}

#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn put_account(&self, account: CreditAccount) -> Result<(), DbError>;
    async fn get_account(&self, account_id: &AccountId) -> Result<Option<CreditAccount>, DbError>;
    async fn list_accounts(&self) -> Result<Vec<CreditAccount>, DbError>;
}

#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts the transaction if its id is unseen. Returns `false` on a
    /// duplicate id; the stored transaction is left untouched.
    async fn insert_transaction(&self, tx: CreditTransaction) -> Result<bool, DbError>;
    async fn get_transaction(&self, tx_id: &TxId) -> Result<Option<CreditTransaction>, DbError>;
    async fn contains_transaction(&self, tx_id: &TxId) -> Result<bool, DbError>;
}

#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait OrderingStore: Send + Sync {
    /// Appends the entry, enforcing a gapless sequence and an intact hash
    /// link to the current head. The append is serialised internally.
    async fn append_entry(&self, entry: OrderingEntry) -> Result<(), DbError>;
    async fn latest_entry(&self) -> Result<Option<OrderingEntry>, DbError>;
    async fn get_entry(&self, sequence: u64) -> Result<Option<OrderingEntry>, DbError>;
    /// Entries with `from <= sequence_number <= to`, ascending.
    async fn get_range(&self, from: u64, to: u64) -> Result<Vec<OrderingEntry>, DbError>;
    async fn entry_count(&self) -> Result<u64, DbError>;
    /// Removes every entry with `sequence_number >= from`. Used only by
    /// divergence resolution.
    async fn truncate_from(&self, from: u64) -> Result<(), DbError>;
}

#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait IntentStore: Send + Sync {
    async fn put_intent(&self, intent: PaymentIntent) -> Result<(), DbError>;
    async fn get_intent(&self, task_id: &TaskId) -> Result<Option<PaymentIntent>, DbError>;
    async fn set_intent_state(
        &self,
        task_id: &TaskId,
        state: IntentState,
    ) -> Result<(), DbError>;
}

/// The full store surface a node needs.
pub trait PersistentStore:
    AgentStore + TaskStore + AccountStore + TransactionStore + OrderingStore + IntentStore
{
}

impl<T> PersistentStore for T where
    T: AgentStore + TaskStore + AccountStore + TransactionStore + OrderingStore + IntentStore
{
}
