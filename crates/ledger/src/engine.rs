//! The credit engine.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use edgecoder_db::{CreditAccount, OrderingEntry, OrderingEventType, PersistentStore};
use edgecoder_mesh_types::{CreditReason, CreditTransaction};
use edgecoder_primitives::{now_millis, AccountId, Buf32, EpochId, TxId};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{LedgerError, OrderingLog};

/// Result of recording one transaction.
#[derive(Debug)]
pub enum RecordOutcome {
    /// Settled and ordered.
    Applied(OrderingEntry),
    /// The transaction id was already in the chain; nothing changed.
    Duplicate,
}

/// Response to an offline-ledger batch submission. Submitting the same
/// batch twice yields the same ledger state: the second pass reports every
/// id under `skipped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BleSyncReport {
    pub applied: Vec<TxId>,
    pub skipped: Vec<TxId>,
    pub total: usize,
}

/// Single-sided grant recorded for seed rewards, faucets, and adjustments.
#[derive(Debug, Serialize)]
struct GrantPayload<'a> {
    account: &'a AccountId,
    credits: f64,
    reason: CreditReason,
    memo: &'a str,
}

#[derive(Debug, Serialize)]
struct IssuancePayload<'a> {
    epoch: EpochId,
    earnings: &'a BTreeMap<AccountId, f64>,
}

/// Maintains balances and settles transactions into the ordering log.
///
/// One lock guards every balance mutation together with its ordering
/// append, so observers never see a settled transfer without its chain
/// entry or vice versa.
pub struct CreditEngine<S> {
    store: Arc<S>,
    ordering: Arc<OrderingLog<S>>,
    apply_lock: Mutex<()>,
}

impl<S> std::fmt::Debug for CreditEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditEngine").finish_non_exhaustive()
    }
}

impl<S: PersistentStore> CreditEngine<S> {
    pub fn new(store: Arc<S>, ordering: Arc<OrderingLog<S>>) -> Self {
        Self {
            store,
            ordering,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn ordering(&self) -> &Arc<OrderingLog<S>> {
        &self.ordering
    }

    /// Verifies both signatures, applies the transfer atomically, and
    /// orders the transaction. Duplicate ids are reported, not errors.
    pub async fn record_transaction(
        &self,
        tx: CreditTransaction,
        requester_key: &Buf32,
        provider_key: &Buf32,
    ) -> Result<RecordOutcome, LedgerError> {
        if !tx.credits.is_finite() || tx.credits < 0.0 {
            return Err(LedgerError::InvalidAmount(tx.tx_id.clone()));
        }
        tx.verify(requester_key, provider_key)
            .map_err(|_| LedgerError::BadTransactionSignature(tx.tx_id.clone()))?;

        let _guard = self.apply_lock.lock().await;

        if self.store.contains_transaction(&tx.tx_id).await? {
            debug!(tx_id = %tx.tx_id, "duplicate transaction skipped");
            return Ok(RecordOutcome::Duplicate);
        }

        self.apply_transfer(&tx).await?;
        self.store.insert_transaction(tx.clone()).await?;
        let entry = self
            .ordering
            .append_event(OrderingEventType::CreditTransaction, &tx)
            .await?;

        info!(
            tx_id = %tx.tx_id,
            credits = tx.credits,
            requester = %tx.requester_account,
            provider = %tx.provider_account,
            "credit transaction settled"
        );
        Ok(RecordOutcome::Applied(entry))
    }

    /// Ingests a batch from an offline ledger. Each transaction is skipped
    /// if its id is already known, if either party's key cannot be
    /// resolved, or if a signature fails; everything else applies.
    pub async fn sync_offline_batch(
        &self,
        batch: Vec<CreditTransaction>,
        resolve_key: impl Fn(&AccountId) -> Option<Buf32>,
    ) -> Result<BleSyncReport, LedgerError> {
        let total = batch.len();
        let mut applied = Vec::new();
        let mut skipped = Vec::new();

        for tx in batch {
            let keys = resolve_key(&tx.requester_account)
                .zip(resolve_key(&tx.provider_account));
            let Some((requester_key, provider_key)) = keys else {
                warn!(tx_id = %tx.tx_id, "offline transaction with unknown party skipped");
                skipped.push(tx.tx_id);
                continue;
            };

            let tx_id = tx.tx_id.clone();
            match self
                .record_transaction(tx, &requester_key, &provider_key)
                .await
            {
                Ok(RecordOutcome::Applied(_)) => applied.push(tx_id),
                Ok(RecordOutcome::Duplicate) => skipped.push(tx_id),
                Err(LedgerError::BadTransactionSignature(_) | LedgerError::InvalidAmount(_)) => {
                    warn!(tx_id = %tx_id, "offline transaction failed validation");
                    skipped.push(tx_id);
                }
                Err(other) => return Err(other),
            }
        }

        Ok(BleSyncReport {
            applied,
            skipped,
            total,
        })
    }

    /// Records a single-sided credit grant (seed reward, faucet, manual
    /// adjustment).
    pub async fn grant(
        &self,
        account: &AccountId,
        credits: f64,
        reason: CreditReason,
        memo: &str,
    ) -> Result<OrderingEntry, LedgerError> {
        let _guard = self.apply_lock.lock().await;

        self.adjust_balance(account, credits).await?;
        let entry = self
            .ordering
            .append_event(
                OrderingEventType::Adjustment,
                &GrantPayload {
                    account,
                    credits,
                    reason,
                    memo,
                },
            )
            .await?;
        info!(%account, credits, ?reason, "credit grant recorded");
        Ok(entry)
    }

    /// Rewards a model seeder after a checksum-verified transfer.
    pub async fn seed_reward(
        &self,
        account: &AccountId,
        size_bytes: u64,
        seeder_count: u32,
    ) -> Result<OrderingEntry, LedgerError> {
        let credits = edgecoder_pricing::model_seed_credits(size_bytes, seeder_count);
        self.grant(account, credits, CreditReason::ModelSeed, "model seed transfer")
            .await
    }

    /// Applies a quorum-approved issuance commit: credits every account in
    /// the earnings map and orders a single commit event.
    pub async fn apply_issuance(
        &self,
        epoch: EpochId,
        earnings: &BTreeMap<AccountId, f64>,
    ) -> Result<OrderingEntry, LedgerError> {
        let _guard = self.apply_lock.lock().await;

        for (account, credits) in earnings {
            self.adjust_balance(account, *credits).await?;
        }
        let entry = self
            .ordering
            .append_event(
                OrderingEventType::IssuanceCommit,
                &IssuancePayload { epoch, earnings },
            )
            .await?;
        info!(%epoch, accounts = earnings.len(), "issuance applied");
        Ok(entry)
    }

    pub async fn balance(&self, account: &AccountId) -> Result<f64, LedgerError> {
        Ok(self
            .store
            .get_account(account)
            .await?
            .map(|a| a.balance)
            .unwrap_or(0.0))
    }

    /// Re-appends rolled-back entries onto the new head after divergence
    /// resolution. Balance effects were applied when the entries were
    /// first recorded, so only the chain positions change. Entries whose
    /// transaction ids arrived in the adopted remote range are dropped.
    pub async fn reorder_entries(
        &self,
        removed: Vec<OrderingEntry>,
        adopted_tx_ids: &HashSet<TxId>,
    ) -> Result<u64, LedgerError> {
        let mut reordered = 0u64;
        for entry in removed {
            if entry.event_type == OrderingEventType::CreditTransaction {
                if let Ok(tx) = serde_json::from_str::<CreditTransaction>(&entry.payload_json) {
                    if adopted_tx_ids.contains(&tx.tx_id) {
                        debug!(tx_id = %tx.tx_id, "dropping reordered duplicate");
                        continue;
                    }
                }
            }
            let payload: serde_json::Value = serde_json::from_str(&entry.payload_json)?;
            self.ordering.append_event(entry.event_type, &payload).await?;
            reordered += 1;
        }
        Ok(reordered)
    }

    /// Adopts entries fetched from a longer remote chain: credit
    /// transactions unseen locally get their balance effects applied, then
    /// the entries extend the chain verbatim.
    pub async fn adopt_remote_entries(
        &self,
        entries: Vec<OrderingEntry>,
    ) -> Result<HashSet<TxId>, LedgerError> {
        let _guard = self.apply_lock.lock().await;

        let mut adopted_tx_ids = HashSet::new();
        for entry in &entries {
            if entry.event_type != OrderingEventType::CreditTransaction {
                continue;
            }
            let Ok(tx) = serde_json::from_str::<CreditTransaction>(&entry.payload_json) else {
                continue;
            };
            adopted_tx_ids.insert(tx.tx_id.clone());
            if self.store.insert_transaction(tx.clone()).await? {
                self.apply_transfer(&tx).await?;
            }
        }

        self.ordering.extend_with(entries).await?;
        Ok(adopted_tx_ids)
    }

    /// Resolves a fork against a remote chain segment (fetched from the
    /// divergence lookback window): finds the last common entry, rolls
    /// back past it, adopts the remote suffix, and re-orders the surviving
    /// local events on top. Fails with [`LedgerError::RangeMismatch`] when
    /// no common entry exists inside the segment, which escalates to the
    /// issuance quorum.
    pub async fn resolve_fork(
        &self,
        remote_entries: Vec<OrderingEntry>,
    ) -> Result<u64, LedgerError> {
        let mut fork_seq = None;
        for entry in &remote_entries {
            let matches_local = self
                .ordering
                .get_entry(entry.sequence_number)
                .await?
                .is_some_and(|local| local.event_hash == entry.event_hash);
            if matches_local {
                fork_seq = Some(entry.sequence_number);
            } else {
                break;
            }
        }
        let fork_seq = fork_seq.ok_or(LedgerError::RangeMismatch)?;

        let removed = self.ordering.rollback_to(fork_seq).await?;
        let suffix: Vec<OrderingEntry> = remote_entries
            .into_iter()
            .filter(|e| e.sequence_number > fork_seq)
            .collect();
        let adopted = self.adopt_remote_entries(suffix).await?;
        let reordered = self.reorder_entries(removed, &adopted).await?;
        info!(fork_seq, reordered, "fork resolved against remote chain");
        Ok(reordered)
    }

    async fn apply_transfer(&self, tx: &CreditTransaction) -> Result<(), LedgerError> {
        self.adjust_balance(&tx.requester_account, -tx.credits)
            .await?;
        self.adjust_balance(&tx.provider_account, tx.credits).await
    }

    async fn adjust_balance(&self, account: &AccountId, delta: f64) -> Result<(), LedgerError> {
        let now = now_millis();
        let mut record = self
            .store
            .get_account(account)
            .await?
            .unwrap_or_else(|| CreditAccount::new(account.clone(), now));
        record.balance += delta;
        record.updated_at_ms = now;
        self.store.put_account(record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use edgecoder_crypto::IdentityKey;
    use edgecoder_db::MemoryStore;
    use edgecoder_mesh_types::SignedBid;
    use edgecoder_primitives::{sha256, AgentId};

    use super::*;

    struct Fixture {
        engine: CreditEngine<MemoryStore>,
        requester: IdentityKey,
        provider: IdentityKey,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let identity = Arc::new(IdentityKey::generate());
        let ordering = Arc::new(OrderingLog::new(
            store.clone(),
            identity,
            AgentId::new("c1"),
        ));
        Fixture {
            engine: CreditEngine::new(store, ordering),
            requester: IdentityKey::generate(),
            provider: IdentityKey::generate(),
        }
    }

    fn make_tx(fx: &Fixture, tx_id: &str, credits: f64) -> CreditTransaction {
        let task_hash = sha256(tx_id.as_bytes());
        let timestamp = 1_700_000_000_000;
        let requester_account = AccountId::new("acct-r");
        let provider_account = AccountId::new("acct-p");
        let bid = SignedBid::create(&fx.requester, task_hash, timestamp, requester_account.clone());
        let tx_id = TxId::new(tx_id);
        let provider_signature = fx.provider.sign(&CreditTransaction::provider_signing_bytes(
            &tx_id,
            &task_hash,
            credits,
            credits,
            &provider_account,
        ));
        CreditTransaction {
            tx_id,
            requester_id: AgentId::new("a1"),
            provider_id: AgentId::new("a2"),
            requester_account,
            provider_account,
            credits,
            cpu_seconds: credits,
            task_hash,
            timestamp,
            reason: CreditReason::TaskPayment,
            requester_signature: bid.signature,
            provider_signature,
        }
    }

    #[tokio::test]
    async fn settlement_moves_credits_and_orders_event() {
        let fx = fixture();
        let tx = make_tx(&fx, "tx-1", 2.0);

        let outcome = fx
            .engine
            .record_transaction(tx, &fx.requester.public_key(), &fx.provider.public_key())
            .await
            .unwrap();
        assert!(matches!(outcome, RecordOutcome::Applied(_)));

        assert_eq!(
            fx.engine.balance(&AccountId::new("acct-r")).await.unwrap(),
            -2.0
        );
        assert_eq!(
            fx.engine.balance(&AccountId::new("acct-p")).await.unwrap(),
            2.0
        );
        let (seq, _) = fx.engine.ordering().head().await.unwrap().unwrap();
        assert_eq!(seq, 0);
    }

    #[tokio::test]
    async fn duplicates_do_not_double_apply() {
        let fx = fixture();
        let tx = make_tx(&fx, "tx-1", 2.0);
        let rk = fx.requester.public_key();
        let pk = fx.provider.public_key();

        fx.engine
            .record_transaction(tx.clone(), &rk, &pk)
            .await
            .unwrap();
        let second = fx.engine.record_transaction(tx, &rk, &pk).await.unwrap();
        assert!(matches!(second, RecordOutcome::Duplicate));
        assert_eq!(
            fx.engine.balance(&AccountId::new("acct-p")).await.unwrap(),
            2.0
        );
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let fx = fixture();
        let mut tx = make_tx(&fx, "tx-1", 2.0);
        tx.credits = 99.0; // breaks the provider signature
        let err = fx
            .engine
            .record_transaction(tx, &fx.requester.public_key(), &fx.provider.public_key())
            .await;
        assert!(matches!(err, Err(LedgerError::BadTransactionSignature(_))));
    }

    #[tokio::test]
    async fn ble_sync_is_idempotent() {
        let fx = fixture();
        let tx = make_tx(&fx, "tx-1", 3.2);
        let rk = fx.requester.public_key();
        let pk = fx.provider.public_key();
        let resolve = move |account: &AccountId| match account.as_str() {
            "acct-r" => Some(rk),
            "acct-p" => Some(pk),
            _ => None,
        };

        let first = fx
            .engine
            .sync_offline_batch(vec![tx.clone()], resolve)
            .await
            .unwrap();
        assert_eq!(first.applied, vec![tx.tx_id.clone()]);
        assert!(first.skipped.is_empty());
        assert_eq!(first.total, 1);

        let second = fx
            .engine
            .sync_offline_batch(vec![tx.clone()], resolve)
            .await
            .unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.skipped, vec![tx.tx_id]);
        assert_eq!(second.total, 1);
    }

    #[tokio::test]
    async fn unknown_party_is_skipped() {
        let fx = fixture();
        let tx = make_tx(&fx, "tx-1", 1.0);
        let report = fx
            .engine
            .sync_offline_batch(vec![tx], |_| None)
            .await
            .unwrap();
        assert_eq!(report.applied.len(), 0);
        assert_eq!(report.skipped.len(), 1);
    }

    #[tokio::test]
    async fn fork_resolution_adopts_remote_and_reorders_local() {
        // c1 holds [e0, e2]; c2 holds [e0, e3, e4]; after resolution c1
        // holds [e0, e3, e4, e2'] with e2 re-ordered onto the new head.
        let c1 = fixture();
        let c2 = fixture();
        let account = AccountId::new("a");

        c1.engine
            .grant(&account, 1.0, CreditReason::Faucet, "e0")
            .await
            .unwrap();
        let prefix = c1.engine.ordering().get_range(0, 0).await.unwrap();
        c2.engine.adopt_remote_entries(prefix).await.unwrap();

        c1.engine
            .grant(&account, 2.0, CreditReason::Faucet, "e2")
            .await
            .unwrap();
        c2.engine
            .grant(&account, 3.0, CreditReason::Faucet, "e3")
            .await
            .unwrap();
        c2.engine
            .grant(&account, 4.0, CreditReason::Faucet, "e4")
            .await
            .unwrap();

        let remote = c2.engine.ordering().get_range(0, 2).await.unwrap();
        let reordered = c1.engine.resolve_fork(remote).await.unwrap();
        assert_eq!(reordered, 1);

        let (head_seq, _) = c1.engine.ordering().head().await.unwrap().unwrap();
        assert_eq!(head_seq, 3);
        assert_eq!(c1.engine.ordering().audit().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn fork_without_common_ancestor_escalates() {
        let c1 = fixture();
        let c2 = fixture();
        let account = AccountId::new("a");
        // completely unrelated chains
        c1.engine
            .grant(&account, 1.0, CreditReason::Faucet, "left")
            .await
            .unwrap();
        c2.engine
            .grant(&account, 1.0, CreditReason::Faucet, "right")
            .await
            .unwrap();

        let remote = c2.engine.ordering().get_range(0, 0).await.unwrap();
        assert!(matches!(
            c1.engine.resolve_fork(remote).await,
            Err(LedgerError::RangeMismatch)
        ));
    }

    #[tokio::test]
    async fn grants_and_issuance_credit_accounts() {
        let fx = fixture();
        let account = AccountId::new("seeder");
        fx.engine
            .seed_reward(&account, 1_073_741_824, 1)
            .await
            .unwrap();
        assert!((fx.engine.balance(&account).await.unwrap() - 1.0).abs() < 1e-9);

        let mut earnings = BTreeMap::new();
        earnings.insert(account.clone(), 5.0);
        fx.engine
            .apply_issuance(EpochId::new(1), &earnings)
            .await
            .unwrap();
        assert!((fx.engine.balance(&account).await.unwrap() - 6.0).abs() < 1e-9);
    }
}
