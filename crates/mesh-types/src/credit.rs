//! Credit transaction wire types.

use edgecoder_crypto::{verify_signature, CryptoError, IdentityKey};
use edgecoder_primitives::{AccountId, AgentId, Buf32, Buf64, TxId};
use serde::{Deserialize, Serialize};

/// Why a transaction moved credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    /// Requester side of a completed task.
    TaskPayment,
    /// Provider side of a completed task.
    TaskExecution,
    /// Reward for seeding a model file to a peer.
    ModelSeed,
    Faucet,
    Adjust,
    Issuance,
}

/// The requester's pre-commitment, signed before the task is dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedBid {
    pub task_hash: Buf32,
    pub timestamp: u64,
    pub requester_account: AccountId,
    pub signature: Buf64,
}

impl SignedBid {
    /// Canonical bytes the requester signs: `task_hash || timestamp || account`.
    pub fn signing_bytes(task_hash: &Buf32, timestamp: u64, account: &AccountId) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(task_hash.as_bytes());
        bytes.extend_from_slice(timestamp.to_string().as_bytes());
        bytes.extend_from_slice(account.as_str().as_bytes());
        bytes
    }

    pub fn create(
        key: &IdentityKey,
        task_hash: Buf32,
        timestamp: u64,
        requester_account: AccountId,
    ) -> Self {
        let signature = key.sign(&Self::signing_bytes(&task_hash, timestamp, &requester_account));
        Self {
            task_hash,
            timestamp,
            requester_account,
            signature,
        }
    }

    pub fn verify(&self, requester_key: &Buf32) -> Result<(), CryptoError> {
        verify_signature(
            requester_key,
            &Self::signing_bytes(&self.task_hash, self.timestamp, &self.requester_account),
            &self.signature,
        )
    }
}

/// A dual-signed transfer of credits between two accounts.
///
/// Immutable once recorded in the ordering chain; deduplicated everywhere
/// by `tx_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub tx_id: TxId,
    pub requester_id: AgentId,
    pub provider_id: AgentId,
    pub requester_account: AccountId,
    pub provider_account: AccountId,
    pub credits: f64,
    pub cpu_seconds: f64,
    pub task_hash: Buf32,
    pub timestamp: u64,
    pub reason: CreditReason,
    pub requester_signature: Buf64,
    pub provider_signature: Buf64,
}

impl CreditTransaction {
    /// Canonical bytes both parties sign. The requester signs these via its
    /// earlier bid binding (`task_hash`/`timestamp`/account); the provider
    /// signs the full transfer terms.
    pub fn provider_signing_bytes(
        tx_id: &TxId,
        task_hash: &Buf32,
        credits: f64,
        cpu_seconds: f64,
        provider_account: &AccountId,
    ) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(96);
        bytes.extend_from_slice(tx_id.as_str().as_bytes());
        bytes.extend_from_slice(task_hash.as_bytes());
        bytes.extend_from_slice(format!("{credits:.6}").as_bytes());
        bytes.extend_from_slice(format!("{cpu_seconds:.6}").as_bytes());
        bytes.extend_from_slice(provider_account.as_str().as_bytes());
        bytes
    }

    /// Verifies both signatures against the parties' public keys.
    pub fn verify(
        &self,
        requester_key: &Buf32,
        provider_key: &Buf32,
    ) -> Result<(), CryptoError> {
        verify_signature(
            requester_key,
            &SignedBid::signing_bytes(&self.task_hash, self.timestamp, &self.requester_account),
            &self.requester_signature,
        )?;
        verify_signature(
            provider_key,
            &Self::provider_signing_bytes(
                &self.tx_id,
                &self.task_hash,
                self.credits,
                self.cpu_seconds,
                &self.provider_account,
            ),
            &self.provider_signature,
        )
    }
}

#[cfg(test)]
mod tests {
    use edgecoder_primitives::sha256;

    use super::*;

    fn make_tx(
        requester: &IdentityKey,
        provider: &IdentityKey,
        credits: f64,
    ) -> CreditTransaction {
        let task_hash = sha256(b"print(1)");
        let timestamp = 1_700_000_000_000;
        let requester_account = AccountId::new("acct-r");
        let provider_account = AccountId::new("acct-p");
        let bid = SignedBid::create(requester, task_hash, timestamp, requester_account.clone());

        let tx_id = TxId::new("tx-1");
        let provider_signature = provider.sign(&CreditTransaction::provider_signing_bytes(
            &tx_id,
            &task_hash,
            credits,
            3.2,
            &provider_account,
        ));

        CreditTransaction {
            tx_id,
            requester_id: AgentId::new("a1"),
            provider_id: AgentId::new("a2"),
            requester_account,
            provider_account,
            credits,
            cpu_seconds: 3.2,
            task_hash,
            timestamp,
            reason: CreditReason::TaskPayment,
            requester_signature: bid.signature,
            provider_signature,
        }
    }

    #[test]
    fn dual_signatures_verify() {
        let requester = IdentityKey::generate();
        let provider = IdentityKey::generate();
        let tx = make_tx(&requester, &provider, 3.2);
        tx.verify(&requester.public_key(), &provider.public_key())
            .unwrap();
    }

    #[test]
    fn altered_credits_breaks_provider_signature() {
        let requester = IdentityKey::generate();
        let provider = IdentityKey::generate();
        let mut tx = make_tx(&requester, &provider, 3.2);
        tx.credits = 100.0;
        assert!(tx
            .verify(&requester.public_key(), &provider.public_key())
            .is_err());
    }

    #[test]
    fn swapped_keys_fail() {
        let requester = IdentityKey::generate();
        let provider = IdentityKey::generate();
        let tx = make_tx(&requester, &provider, 3.2);
        assert!(tx
            .verify(&provider.public_key(), &requester.public_key())
            .is_err());
    }
}
