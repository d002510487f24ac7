//! The offline credit ledger.

use std::collections::BTreeMap;

use edgecoder_mesh_types::CreditTransaction;
use edgecoder_primitives::TxId;
use parking_lot::Mutex;
use tracing::debug;

/// Transactions settled while the node had no internet path, keyed and
/// deduplicated by transaction id. Flushed to the coordinator's
/// `credits_ble_sync` endpoint on reconnect.
#[derive(Debug, Default)]
pub struct OfflineLedger {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: BTreeMap<TxId, CreditTransaction>,
    synced: BTreeMap<TxId, CreditTransaction>,
}

impl OfflineLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a transaction. Returns `false` if its id was already known
    /// (pending or synced).
    pub fn record(&self, tx: CreditTransaction) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending.contains_key(&tx.tx_id) || inner.synced.contains_key(&tx.tx_id) {
            debug!(tx_id = %tx.tx_id, "offline ledger duplicate ignored");
            return false;
        }
        inner.pending.insert(tx.tx_id.clone(), tx);
        true
    }

    /// Transactions awaiting sync.
    pub fn pending(&self) -> Vec<CreditTransaction> {
        self.inner.lock().pending.values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Snapshot of the pending set for submission. Entries stay pending
    /// until [`Self::mark_synced`] confirms them.
    pub fn export_batch(&self) -> Vec<CreditTransaction> {
        self.pending()
    }

    /// Moves confirmed ids out of the pending set.
    pub fn mark_synced<'a>(&self, tx_ids: impl IntoIterator<Item = &'a TxId>) {
        let mut inner = self.inner.lock();
        for tx_id in tx_ids {
            if let Some(tx) = inner.pending.remove(tx_id) {
                inner.synced.insert(tx_id.clone(), tx);
            }
        }
    }

    /// Drops everything, synced history included.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.pending.clear();
        inner.synced.clear();
    }
}

#[cfg(test)]
mod tests {
    use edgecoder_mesh_types::CreditReason;
    use edgecoder_primitives::{sha256, AccountId, AgentId, Buf64};

    use super::*;

    fn tx(id: &str, credits: f64) -> CreditTransaction {
        CreditTransaction {
            tx_id: TxId::new(id),
            requester_id: AgentId::new("a"),
            provider_id: AgentId::new("b"),
            requester_account: AccountId::new("acct-a"),
            provider_account: AccountId::new("acct-b"),
            credits,
            cpu_seconds: credits,
            task_hash: sha256(id.as_bytes()),
            timestamp: 1,
            reason: CreditReason::TaskPayment,
            requester_signature: Buf64::zero(),
            provider_signature: Buf64::zero(),
        }
    }

    #[test]
    fn record_deduplicates() {
        let ledger = OfflineLedger::new();
        assert!(ledger.record(tx("tx-1", 1.0)));
        assert!(!ledger.record(tx("tx-1", 2.0)));
        assert_eq!(ledger.pending_count(), 1);
    }

    #[test]
    fn synced_ids_leave_pending_but_stay_deduplicated() {
        let ledger = OfflineLedger::new();
        ledger.record(tx("tx-1", 1.0));
        ledger.record(tx("tx-2", 2.0));

        let batch = ledger.export_batch();
        assert_eq!(batch.len(), 2);

        ledger.mark_synced([&TxId::new("tx-1")]);
        assert_eq!(ledger.pending_count(), 1);
        // the synced transaction cannot be re-recorded
        assert!(!ledger.record(tx("tx-1", 1.0)));
    }

    #[test]
    fn clear_empties_everything() {
        let ledger = OfflineLedger::new();
        ledger.record(tx("tx-1", 1.0));
        ledger.mark_synced([&TxId::new("tx-1")]);
        ledger.record(tx("tx-2", 2.0));
        ledger.clear();
        assert_eq!(ledger.pending_count(), 0);
        assert!(ledger.record(tx("tx-1", 1.0)));
    }
}
