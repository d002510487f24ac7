use edgecoder_crypto::CryptoError;
use edgecoder_db::DbError;
use edgecoder_primitives::{AccountId, TxId};
use thiserror::Error;

/// Ledger-level failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Db(#[from] DbError),

    /// One of the transaction signatures did not verify.
    #[error("transaction {0} signature invalid")]
    BadTransactionSignature(TxId),

    /// Signature machinery failure outside a transaction context.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Negative or non-finite credit amount.
    #[error("invalid credit amount for transaction {0}")]
    InvalidAmount(TxId),

    /// The signer of a transaction is not a registered identity.
    #[error("no known key for account {0}")]
    UnknownSigner(AccountId),

    /// The stored chain failed verification. The ledger halts on this.
    #[error("ordering chain corrupt at sequence {sequence}")]
    ChainCorrupt { sequence: u64 },

    /// A fetched remote range did not link onto the local head.
    #[error("remote range does not extend local chain")]
    RangeMismatch,

    /// Issuance commit attempted without quorum.
    #[error("issuance quorum not reached: {votes}/{needed}")]
    QuorumNotReached { votes: u32, needed: u32 },

    #[error("canonical serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
