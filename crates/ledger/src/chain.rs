//! The per-coordinator ordering log.

use std::sync::Arc;

use edgecoder_crypto::IdentityKey;
use edgecoder_db::{
    compute_event_hash, verify_chain_link, OrderingEntry, OrderingEventType, OrderingStore,
    ORDERING_GENESIS,
};
use edgecoder_primitives::{now_millis, AgentId, Buf32};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::LedgerError;

/// How a remote head relates to our chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteHeadStatus {
    /// Remote head is our head.
    InSync,
    /// Remote head is an ancestor inside our lookback window.
    Ahead,
    /// Remote is further along; fetch `from..=to` and extend.
    Behind { from: u64, to: u64 },
    /// No common ancestor within the lookback window.
    Diverged,
}

/// Append-only hash-linked event log.
///
/// All mutation paths (`append`, `extend_with`, `rollback_to`) serialise on
/// an internal lock; reads go straight to the store.
pub struct OrderingLog<S> {
    store: Arc<S>,
    identity: Arc<IdentityKey>,
    signer_id: AgentId,
    write_lock: Mutex<()>,
}

impl<S> std::fmt::Debug for OrderingLog<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderingLog")
            .field("signer_id", &self.signer_id)
            .finish_non_exhaustive()
    }
}

impl<S: OrderingStore> OrderingLog<S> {
    pub fn new(store: Arc<S>, identity: Arc<IdentityKey>, signer_id: AgentId) -> Self {
        Self {
            store,
            identity,
            signer_id,
            write_lock: Mutex::new(()),
        }
    }

    /// Serialises the payload canonically, links it onto the head, signs
    /// the event hash, and appends.
    pub async fn append_event<P: Serialize>(
        &self,
        event_type: OrderingEventType,
        payload: &P,
    ) -> Result<OrderingEntry, LedgerError> {
        let _guard = self.write_lock.lock().await;

        let payload_json = serde_json::to_string(payload)?;
        let timestamp = now_millis();
        let prev = self.store.latest_entry().await?;
        let (sequence_number, prev_event_hash) = match &prev {
            Some(entry) => (entry.sequence_number + 1, entry.event_hash.to_hex()),
            None => (0, ORDERING_GENESIS.to_owned()),
        };

        let event_hash =
            compute_event_hash(&prev_event_hash, &payload_json, &self.signer_id, timestamp);
        let entry = OrderingEntry {
            sequence_number,
            prev_event_hash,
            event_hash,
            event_type,
            payload_json,
            signer_id: self.signer_id.clone(),
            signature: self.identity.sign(event_hash.as_bytes()),
            timestamp,
        };

        self.store.append_entry(entry.clone()).await?;
        Ok(entry)
    }

    /// Current head, if the chain is non-empty.
    pub async fn head(&self) -> Result<Option<(u64, Buf32)>, LedgerError> {
        Ok(self
            .store
            .latest_entry()
            .await?
            .map(|e| (e.sequence_number, e.event_hash)))
    }

    pub async fn get_range(&self, from: u64, to: u64) -> Result<Vec<OrderingEntry>, LedgerError> {
        Ok(self.store.get_range(from, to).await?)
    }

    pub async fn get_entry(&self, sequence: u64) -> Result<Option<OrderingEntry>, LedgerError> {
        Ok(self.store.get_entry(sequence).await?)
    }

    /// Classifies a peer's advertised head against the local chain,
    /// looking back at most `lookback` entries for a common ancestor.
    pub async fn classify_remote_head(
        &self,
        remote_seq: u64,
        remote_hash: &Buf32,
        lookback: u64,
    ) -> Result<RemoteHeadStatus, LedgerError> {
        let Some((local_seq, local_hash)) = self.head().await? else {
            // Empty local chain: everything the remote has is new.
            return Ok(RemoteHeadStatus::Behind {
                from: 0,
                to: remote_seq,
            });
        };

        if remote_seq == local_seq {
            return Ok(if remote_hash == &local_hash {
                RemoteHeadStatus::InSync
            } else {
                RemoteHeadStatus::Diverged
            });
        }

        if remote_seq < local_seq {
            // The remote head should be one of our recent entries.
            let from = local_seq.saturating_sub(lookback);
            if remote_seq >= from {
                if let Some(entry) = self.store.get_entry(remote_seq).await? {
                    if entry.event_hash == *remote_hash {
                        return Ok(RemoteHeadStatus::Ahead);
                    }
                }
            }
            return Ok(RemoteHeadStatus::Diverged);
        }

        // Remote is longer. Whether it extends us is settled when the
        // fetched range is validated against our head in `extend_with`.
        Ok(RemoteHeadStatus::Behind {
            from: local_seq + 1,
            to: remote_seq,
        })
    }

    /// Validates and appends a fetched range. The first entry must link
    /// onto the local head; every later entry must link onto its
    /// predecessor.
    pub async fn extend_with(&self, entries: Vec<OrderingEntry>) -> Result<u64, LedgerError> {
        let _guard = self.write_lock.lock().await;

        let mut prev = self.store.latest_entry().await?;
        let mut appended = 0u64;
        for entry in entries {
            if let Err(err) = verify_chain_link(prev.as_ref(), &entry) {
                warn!(sequence = entry.sequence_number, error = %err, "fetched range broke chain");
                return Err(LedgerError::RangeMismatch);
            }
            self.store.append_entry(entry.clone()).await?;
            prev = Some(entry);
            appended += 1;
        }
        Ok(appended)
    }

    /// Rolls the chain back so `seq` is the new head, returning the
    /// removed entries oldest-first so their effects can be re-ordered.
    pub async fn rollback_to(&self, seq: u64) -> Result<Vec<OrderingEntry>, LedgerError> {
        let _guard = self.write_lock.lock().await;

        let Some((head_seq, _)) = self
            .store
            .latest_entry()
            .await?
            .map(|e| (e.sequence_number, e.event_hash))
        else {
            return Ok(Vec::new());
        };
        if seq >= head_seq {
            return Ok(Vec::new());
        }

        let removed = self.store.get_range(seq + 1, head_seq).await?;
        self.store.truncate_from(seq + 1).await?;
        info!(new_head = seq, removed = removed.len(), "rolled back ordering chain");
        Ok(removed)
    }

    /// Walks the stored chain verifying every link. Any failure is
    /// corruption: the caller must halt the ledger subsystem.
    pub async fn audit(&self) -> Result<u64, LedgerError> {
        let count = self.store.entry_count().await?;
        if count == 0 {
            return Ok(0);
        }
        let entries = self.store.get_range(0, count - 1).await?;
        let mut prev: Option<&OrderingEntry> = None;
        for entry in &entries {
            verify_chain_link(prev, entry).map_err(|_| LedgerError::ChainCorrupt {
                sequence: entry.sequence_number,
            })?;
            prev = Some(entry);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use edgecoder_db::{DbError, MemoryStore, MockOrderingStore};
    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct Note {
        n: u64,
    }

    fn new_log() -> OrderingLog<MemoryStore> {
        OrderingLog::new(
            Arc::new(MemoryStore::new()),
            Arc::new(IdentityKey::generate()),
            AgentId::new("c1"),
        )
    }

    #[tokio::test]
    async fn appends_link_and_audit_passes() {
        let log = new_log();
        for n in 0..4 {
            log.append_event(OrderingEventType::Adjustment, &Note { n })
                .await
                .unwrap();
        }
        assert_eq!(log.audit().await.unwrap(), 4);
        let (seq, _) = log.head().await.unwrap().unwrap();
        assert_eq!(seq, 3);
    }

    #[tokio::test]
    async fn classify_in_sync_and_behind() {
        let log = new_log();
        let e0 = log
            .append_event(OrderingEventType::Adjustment, &Note { n: 0 })
            .await
            .unwrap();
        assert_eq!(
            log.classify_remote_head(0, &e0.event_hash, 8).await.unwrap(),
            RemoteHeadStatus::InSync
        );
        assert_eq!(
            log.classify_remote_head(5, &Buf32::zero(), 8).await.unwrap(),
            RemoteHeadStatus::Behind { from: 1, to: 5 }
        );
    }

    #[tokio::test]
    async fn classify_ahead_and_diverged() {
        let log = new_log();
        let e0 = log
            .append_event(OrderingEventType::Adjustment, &Note { n: 0 })
            .await
            .unwrap();
        log.append_event(OrderingEventType::Adjustment, &Note { n: 1 })
            .await
            .unwrap();

        // remote sits at our entry 0
        assert_eq!(
            log.classify_remote_head(0, &e0.event_hash, 8).await.unwrap(),
            RemoteHeadStatus::Ahead
        );
        // same height, different hash
        assert_eq!(
            log.classify_remote_head(0, &Buf32::zero(), 8).await.unwrap(),
            RemoteHeadStatus::Diverged
        );
    }

    #[tokio::test]
    async fn extend_with_validates_links() {
        let source = new_log();
        let mut entries = Vec::new();
        for n in 0..3 {
            entries.push(
                source
                    .append_event(OrderingEventType::Adjustment, &Note { n })
                    .await
                    .unwrap(),
            );
        }

        let target = new_log();
        assert_eq!(target.extend_with(entries.clone()).await.unwrap(), 3);
        assert_eq!(target.audit().await.unwrap(), 3);

        // re-extending with a range that does not link fails
        let err = target.extend_with(entries).await;
        assert!(matches!(err, Err(LedgerError::RangeMismatch)));
    }

    #[tokio::test]
    async fn backend_failures_surface_through_the_log() {
        let mut store = MockOrderingStore::new();
        store
            .expect_latest_entry()
            .returning(|| Err(DbError::Backend("tree unavailable".into())));

        let log = OrderingLog::new(
            Arc::new(store),
            Arc::new(IdentityKey::generate()),
            AgentId::new("c1"),
        );
        let err = log
            .append_event(OrderingEventType::Adjustment, &Note { n: 0 })
            .await;
        assert!(matches!(err, Err(LedgerError::Db(_))));
    }

    #[tokio::test]
    async fn rollback_returns_removed_entries() {
        let log = new_log();
        for n in 0..5 {
            log.append_event(OrderingEventType::Adjustment, &Note { n })
                .await
                .unwrap();
        }
        let removed = log.rollback_to(1).await.unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(removed[0].sequence_number, 2);
        let (seq, _) = log.head().await.unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(log.audit().await.unwrap(), 2);
    }
}
