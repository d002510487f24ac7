//! Sled-backed store.
//!
//! One tree per entity, bincode values. Ordering entries are keyed by
//! big-endian sequence number so range scans come back in chain order; the
//! append path holds a dedicated lock to keep the sequence gapless under
//! concurrency.

use async_trait::async_trait;
use edgecoder_mesh_types::CreditTransaction;
use edgecoder_primitives::{AccountId, AgentId, TaskId, TxId};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    types::verify_chain_link, AccountStore, AgentRecord, AgentStore, CreditAccount, DbError,
    IntentState, IntentStore, OrderingEntry, OrderingStore, PaymentIntent, TaskRecord, TaskStore,
    TransactionStore,
};

const AGENTS_TREE: &str = "agents";
const TASKS_TREE: &str = "tasks";
const ACCOUNTS_TREE: &str = "accounts";
const TRANSACTIONS_TREE: &str = "transactions";
const ORDERING_TREE: &str = "ordering";
const INTENTS_TREE: &str = "intents";

#[derive(Debug)]
pub struct SledStore {
    agents: sled::Tree,
    tasks: sled::Tree,
    accounts: sled::Tree,
    transactions: sled::Tree,
    ordering: sled::Tree,
    intents: sled::Tree,
    /// Serialises ordering appends and transaction inserts.
    append_lock: Mutex<()>,
}

impl SledStore {
    /// Opens (creating if needed) all trees on the given database.
    pub fn open(db: &sled::Db) -> Result<Self, DbError> {
        Ok(Self {
            agents: db.open_tree(AGENTS_TREE)?,
            tasks: db.open_tree(TASKS_TREE)?,
            accounts: db.open_tree(ACCOUNTS_TREE)?,
            transactions: db.open_tree(TRANSACTIONS_TREE)?,
            ordering: db.open_tree(ORDERING_TREE)?,
            intents: db.open_tree(INTENTS_TREE)?,
            append_lock: Mutex::new(()),
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DbError> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DbError> {
    Ok(bincode::deserialize(bytes)?)
}

fn get_decoded<T: DeserializeOwned>(
    tree: &sled::Tree,
    key: &[u8],
) -> Result<Option<T>, DbError> {
    tree.get(key)?.map(|bytes| decode(&bytes)).transpose()
}

fn list_decoded<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, DbError> {
    tree.iter()
        .map(|kv| {
            let (_, bytes) = kv?;
            decode(&bytes)
        })
        .collect()
}

fn seq_key(sequence: u64) -> [u8; 8] {
    sequence.to_be_bytes()
}

#[async_trait]
impl AgentStore for SledStore {
    async fn put_agent(&self, record: AgentRecord) -> Result<(), DbError> {
        self.agents.insert(
            record.capability.agent_id.as_str().as_bytes(),
            encode(&record)?,
        )?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<AgentRecord>, DbError> {
        get_decoded(&self.agents, agent_id.as_str().as_bytes())
    }

    async fn remove_agent(&self, agent_id: &AgentId) -> Result<(), DbError> {
        self.agents.remove(agent_id.as_str().as_bytes())?;
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, DbError> {
        list_decoded(&self.agents)
    }
}

#[async_trait]
impl TaskStore for SledStore {
    async fn put_task(&self, record: TaskRecord) -> Result<(), DbError> {
        self.tasks
            .insert(record.spec.task_id.as_str().as_bytes(), encode(&record)?)?;
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, DbError> {
        get_decoded(&self.tasks, task_id.as_str().as_bytes())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, DbError> {
        list_decoded(&self.tasks)
    }

    async fn remove_task(&self, task_id: &TaskId) -> Result<(), DbError> {
        self.tasks.remove(task_id.as_str().as_bytes())?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for SledStore {
    async fn put_account(&self, account: CreditAccount) -> Result<(), DbError> {
        self.accounts
            .insert(account.account_id.as_str().as_bytes(), encode(&account)?)?;
        Ok(())
    }

    async fn get_account(
        &self,
        account_id: &AccountId,
    ) -> Result<Option<CreditAccount>, DbError> {
        get_decoded(&self.accounts, account_id.as_str().as_bytes())
    }

    async fn list_accounts(&self) -> Result<Vec<CreditAccount>, DbError> {
        list_decoded(&self.accounts)
    }
}

#[async_trait]
impl TransactionStore for SledStore {
    async fn insert_transaction(&self, tx: CreditTransaction) -> Result<bool, DbError> {
        let _guard = self.append_lock.lock();
        let key = tx.tx_id.as_str().as_bytes().to_vec();
        if self.transactions.contains_key(&key)? {
            return Ok(false);
        }
        self.transactions.insert(key, encode(&tx)?)?;
        Ok(true)
    }

    async fn get_transaction(
        &self,
        tx_id: &TxId,
    ) -> Result<Option<CreditTransaction>, DbError> {
        get_decoded(&self.transactions, tx_id.as_str().as_bytes())
    }

    async fn contains_transaction(&self, tx_id: &TxId) -> Result<bool, DbError> {
        Ok(self.transactions.contains_key(tx_id.as_str().as_bytes())?)
    }
}

#[async_trait]
impl OrderingStore for SledStore {
    async fn append_entry(&self, entry: OrderingEntry) -> Result<(), DbError> {
        let _guard = self.append_lock.lock();
        let prev = self
            .ordering
            .last()?
            .map(|(_, bytes)| decode::<OrderingEntry>(&bytes))
            .transpose()?;
        verify_chain_link(prev.as_ref(), &entry)?;
        self.ordering
            .insert(seq_key(entry.sequence_number), encode(&entry)?)?;
        Ok(())
    }

    async fn latest_entry(&self) -> Result<Option<OrderingEntry>, DbError> {
        self.ordering
            .last()?
            .map(|(_, bytes)| decode(&bytes))
            .transpose()
    }

    async fn get_entry(&self, sequence: u64) -> Result<Option<OrderingEntry>, DbError> {
        get_decoded(&self.ordering, &seq_key(sequence))
    }

    async fn get_range(&self, from: u64, to: u64) -> Result<Vec<OrderingEntry>, DbError> {
        if from > to {
            return Ok(Vec::new());
        }
        self.ordering
            .range(seq_key(from)..=seq_key(to))
            .map(|kv| {
                let (_, bytes) = kv?;
                decode(&bytes)
            })
            .collect()
    }

    async fn entry_count(&self) -> Result<u64, DbError> {
        Ok(self.ordering.len() as u64)
    }

    async fn truncate_from(&self, from: u64) -> Result<(), DbError> {
        let _guard = self.append_lock.lock();
        let doomed: Vec<_> = self
            .ordering
            .range(seq_key(from)..)
            .map(|kv| kv.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        for key in doomed {
            self.ordering.remove(key)?;
        }
        Ok(())
    }
}

#[async_trait]
impl IntentStore for SledStore {
    async fn put_intent(&self, intent: PaymentIntent) -> Result<(), DbError> {
        self.intents
            .insert(intent.task_id.as_str().as_bytes(), encode(&intent)?)?;
        Ok(())
    }

    async fn get_intent(&self, task_id: &TaskId) -> Result<Option<PaymentIntent>, DbError> {
        get_decoded(&self.intents, task_id.as_str().as_bytes())
    }

    async fn set_intent_state(
        &self,
        task_id: &TaskId,
        state: IntentState,
    ) -> Result<(), DbError> {
        let key = task_id.as_str().as_bytes();
        if let Some(mut intent) = get_decoded::<PaymentIntent>(&self.intents, key)? {
            intent.state = state;
            self.intents.insert(key, encode(&intent)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use edgecoder_crypto::IdentityKey;
    use edgecoder_mesh_types::{
        AgentCapability, AgentMode, ClientType, PowerTelemetry, ProjectMeta, TaskSpec,
    };
    use edgecoder_primitives::Buf64;

    use super::*;
    use crate::{compute_event_hash, OrderingEventType, TaskStatus, ORDERING_GENESIS};

    fn open_store() -> (SledStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::Config::new().path(dir.path()).open().unwrap();
        (SledStore::open(&db).unwrap(), dir)
    }

    fn agent_record(id: &str) -> AgentRecord {
        AgentRecord {
            capability: AgentCapability {
                agent_id: AgentId::new(id),
                account_id: AccountId::new(format!("acct-{id}")),
                public_key: IdentityKey::generate().public_key(),
                os: "linux".into(),
                version: "0.1.0".into(),
                client_type: ClientType::Headless,
                mode: AgentMode::SwarmOnly,
                resource_classes: vec![edgecoder_mesh_types::ResourceClass::Cpu],
                local_models: vec!["qwen:7b".into()],
                active_model: Some("qwen:7b".into()),
                active_model_param_size: 7.0,
                model_swap_in_progress: false,
                max_concurrent_tasks: 2,
                current_load: 0,
                power: PowerTelemetry::default(),
            },
            last_seen_ms: 1_000,
            connected_peers: 0,
        }
    }

    fn ordering_entry(seq: u64, prev: &str) -> OrderingEntry {
        let signer = AgentId::new("c1");
        let payload_json = format!("{{\"seq\":{seq}}}");
        let event_hash = compute_event_hash(prev, &payload_json, &signer, seq);
        OrderingEntry {
            sequence_number: seq,
            prev_event_hash: prev.to_owned(),
            event_hash,
            event_type: OrderingEventType::CreditTransaction,
            payload_json,
            signer_id: signer,
            signature: Buf64::zero(),
            timestamp: seq,
        }
    }

    #[tokio::test]
    async fn agent_round_trip() {
        let (store, _dir) = open_store();
        let record = agent_record("a1");
        store.put_agent(record.clone()).await.unwrap();
        let loaded = store
            .get_agent(&AgentId::new("a1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record);

        store.remove_agent(&AgentId::new("a1")).await.unwrap();
        assert!(store.get_agent(&AgentId::new("a1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn task_round_trip() {
        let (store, _dir) = open_store();
        let record = TaskRecord::new(
            TaskSpec {
                task_id: TaskId::new("t1"),
                kind: "code".into(),
                language: "python".into(),
                input: "print(1)".into(),
                timeout_ms: 60_000,
                snapshot_ref: None,
                project: ProjectMeta::default(),
                required_model_size: 1.5,
                requester_account: None,
            },
            5,
        );
        store.put_task(record.clone()).await.unwrap();
        let loaded = store.get_task(&TaskId::new("t1")).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn ordering_appends_stay_gapless() {
        let (store, _dir) = open_store();
        let genesis = ordering_entry(0, ORDERING_GENESIS);
        store.append_entry(genesis.clone()).await.unwrap();

        let next = ordering_entry(1, &genesis.event_hash.to_hex());
        store.append_entry(next).await.unwrap();

        // skipping sequence 2 must fail
        let skipped = ordering_entry(3, "whatever");
        assert!(matches!(
            store.append_entry(skipped).await,
            Err(DbError::SequenceGap { expected: 2, got: 3 })
        ));
    }

    #[tokio::test]
    async fn ordering_rejects_broken_hash_link() {
        let (store, _dir) = open_store();
        store
            .append_entry(ordering_entry(0, ORDERING_GENESIS))
            .await
            .unwrap();
        let bad = ordering_entry(1, &"00".repeat(32));
        assert!(matches!(
            store.append_entry(bad).await,
            Err(DbError::ChainMismatch { sequence: 1 })
        ));
    }

    #[tokio::test]
    async fn ordering_range_and_truncate() {
        let (store, _dir) = open_store();
        let mut prev = ORDERING_GENESIS.to_owned();
        for seq in 0..5 {
            let entry = ordering_entry(seq, &prev);
            prev = entry.event_hash.to_hex();
            store.append_entry(entry).await.unwrap();
        }

        let range = store.get_range(1, 3).await.unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].sequence_number, 1);
        assert_eq!(range[2].sequence_number, 3);

        store.truncate_from(2).await.unwrap();
        assert_eq!(store.entry_count().await.unwrap(), 2);
        assert_eq!(
            store.latest_entry().await.unwrap().unwrap().sequence_number,
            1
        );
    }

    #[tokio::test]
    async fn duplicate_transactions_are_skipped() {
        let (store, _dir) = open_store();
        let requester = IdentityKey::generate();
        let provider = IdentityKey::generate();
        let task_hash = edgecoder_primitives::sha256(b"in");
        let bid = edgecoder_mesh_types::SignedBid::create(
            &requester,
            task_hash,
            1,
            AccountId::new("r"),
        );
        let tx_id = TxId::new("tx-1");
        let provider_signature =
            provider.sign(&CreditTransaction::provider_signing_bytes(
                &tx_id,
                &task_hash,
                2.0,
                2.0,
                &AccountId::new("p"),
            ));
        let tx = CreditTransaction {
            tx_id,
            requester_id: AgentId::new("a1"),
            provider_id: AgentId::new("a2"),
            requester_account: AccountId::new("r"),
            provider_account: AccountId::new("p"),
            credits: 2.0,
            cpu_seconds: 2.0,
            task_hash,
            timestamp: 1,
            reason: edgecoder_mesh_types::CreditReason::TaskPayment,
            requester_signature: bid.signature,
            provider_signature,
        };

        assert!(store.insert_transaction(tx.clone()).await.unwrap());
        assert!(!store.insert_transaction(tx.clone()).await.unwrap());
        assert!(store.contains_transaction(&tx.tx_id).await.unwrap());
    }

    #[tokio::test]
    async fn intent_state_updates() {
        let (store, _dir) = open_store();
        let requester = IdentityKey::generate();
        let bid = edgecoder_mesh_types::SignedBid::create(
            &requester,
            edgecoder_primitives::sha256(b"in"),
            1,
            AccountId::new("r"),
        );
        store
            .put_intent(PaymentIntent {
                task_id: TaskId::new("t1"),
                bid,
                state: IntentState::Pending,
                created_at_ms: 1,
            })
            .await
            .unwrap();

        store
            .set_intent_state(&TaskId::new("t1"), IntentState::Settled)
            .await
            .unwrap();
        let intent = store.get_intent(&TaskId::new("t1")).await.unwrap().unwrap();
        assert_eq!(intent.state, IntentState::Settled);
    }
}
