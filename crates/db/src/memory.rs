//! In-memory store for tests and ephemeral nodes.

use std::collections::HashMap;

use async_trait::async_trait;
use edgecoder_mesh_types::CreditTransaction;
use edgecoder_primitives::{AccountId, AgentId, TaskId, TxId};
use parking_lot::Mutex;

use crate::{
    types::verify_chain_link, AccountStore, AgentRecord, AgentStore, CreditAccount, DbError,
    IntentState, IntentStore, OrderingEntry, OrderingStore, PaymentIntent, TaskRecord, TaskStore,
    TransactionStore,
};

/// Everything in `HashMap`s, one lock per map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    agents: Mutex<HashMap<AgentId, AgentRecord>>,
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    accounts: Mutex<HashMap<AccountId, CreditAccount>>,
    transactions: Mutex<HashMap<TxId, CreditTransaction>>,
    /// Vec index == sequence number; the mutex doubles as the append lock.
    ordering: Mutex<Vec<OrderingEntry>>,
    intents: Mutex<HashMap<TaskId, PaymentIntent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn put_agent(&self, record: AgentRecord) -> Result<(), DbError> {
        self.agents
            .lock()
            .insert(record.capability.agent_id.clone(), record);
        Ok(())
    }

    async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<AgentRecord>, DbError> {
        Ok(self.agents.lock().get(agent_id).cloned())
    }

    async fn remove_agent(&self, agent_id: &AgentId) -> Result<(), DbError> {
        self.agents.lock().remove(agent_id);
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, DbError> {
        Ok(self.agents.lock().values().cloned().collect())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn put_task(&self, record: TaskRecord) -> Result<(), DbError> {
        self.tasks.lock().insert(record.spec.task_id.clone(), record);
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, DbError> {
        Ok(self.tasks.lock().get(task_id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, DbError> {
        Ok(self.tasks.lock().values().cloned().collect())
    }

    async fn remove_task(&self, task_id: &TaskId) -> Result<(), DbError> {
        self.tasks.lock().remove(task_id);
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn put_account(&self, account: CreditAccount) -> Result<(), DbError> {
        self.accounts
            .lock()
            .insert(account.account_id.clone(), account);
        Ok(())
    }

    async fn get_account(
        &self,
        account_id: &AccountId,
    ) -> Result<Option<CreditAccount>, DbError> {
        Ok(self.accounts.lock().get(account_id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<CreditAccount>, DbError> {
        Ok(self.accounts.lock().values().cloned().collect())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn insert_transaction(&self, tx: CreditTransaction) -> Result<bool, DbError> {
        let mut map = self.transactions.lock();
        if map.contains_key(&tx.tx_id) {
            return Ok(false);
        }
        map.insert(tx.tx_id.clone(), tx);
        Ok(true)
    }

    async fn get_transaction(
        &self,
        tx_id: &TxId,
    ) -> Result<Option<CreditTransaction>, DbError> {
        Ok(self.transactions.lock().get(tx_id).cloned())
    }

    async fn contains_transaction(&self, tx_id: &TxId) -> Result<bool, DbError> {
        Ok(self.transactions.lock().contains_key(tx_id))
    }
}

#[async_trait]
impl OrderingStore for MemoryStore {
    async fn append_entry(&self, entry: OrderingEntry) -> Result<(), DbError> {
        let mut chain = self.ordering.lock();
        verify_chain_link(chain.last(), &entry)?;
        chain.push(entry);
        Ok(())
    }

    async fn latest_entry(&self) -> Result<Option<OrderingEntry>, DbError> {
        Ok(self.ordering.lock().last().cloned())
    }

    async fn get_entry(&self, sequence: u64) -> Result<Option<OrderingEntry>, DbError> {
        Ok(self.ordering.lock().get(sequence as usize).cloned())
    }

    async fn get_range(&self, from: u64, to: u64) -> Result<Vec<OrderingEntry>, DbError> {
        let chain = self.ordering.lock();
        let start = (from as usize).min(chain.len());
        let end = ((to as usize).saturating_add(1)).min(chain.len());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(chain[start..end].to_vec())
    }

    async fn entry_count(&self) -> Result<u64, DbError> {
        Ok(self.ordering.lock().len() as u64)
    }

    async fn truncate_from(&self, from: u64) -> Result<(), DbError> {
        let mut chain = self.ordering.lock();
        chain.truncate(from as usize);
        Ok(())
    }
}

#[async_trait]
impl IntentStore for MemoryStore {
    async fn put_intent(&self, intent: PaymentIntent) -> Result<(), DbError> {
        self.intents.lock().insert(intent.task_id.clone(), intent);
        Ok(())
    }

    async fn get_intent(&self, task_id: &TaskId) -> Result<Option<PaymentIntent>, DbError> {
        Ok(self.intents.lock().get(task_id).cloned())
    }

    async fn set_intent_state(
        &self,
        task_id: &TaskId,
        state: IntentState,
    ) -> Result<(), DbError> {
        if let Some(intent) = self.intents.lock().get_mut(task_id) {
            intent.state = state;
        }
        Ok(())
    }
}
