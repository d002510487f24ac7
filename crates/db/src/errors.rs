use thiserror::Error;

/// Store-level failures.
#[derive(Debug, Error)]
pub enum DbError {
    /// Backend failure (I/O, corruption reported by sled, ...).
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Value failed to encode or decode.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An append would have left a hole in the ordering sequence.
    #[error("ordering sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    /// An append's previous-hash link did not match the current head.
    #[error("ordering chain mismatch at sequence {sequence}")]
    ChainMismatch { sequence: u64 },
}

impl From<sled::Error> for DbError {
    fn from(err: sled::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
