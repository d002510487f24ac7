use edgecoder_crypto::CryptoError;
use thiserror::Error;

/// Protocol-level validation failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope carried a `type` tag we do not know.
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),

    /// Payload did not parse as the shape its `type` tag requires.
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },

    /// A payload field violated a protocol invariant.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Signature did not verify against the sender's public key.
    #[error(transparent)]
    Signature(#[from] CryptoError),

    /// TTL reached zero; the message must not be relayed.
    #[error("ttl exhausted")]
    TtlExhausted,

    /// Serialization failure while producing canonical bytes.
    #[error("canonical serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
