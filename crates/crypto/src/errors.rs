use thiserror::Error;

/// Errors from signing, verification, and sealing operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The public key bytes do not form a valid Ed25519 point.
    #[error("malformed public key")]
    MalformedPublicKey,

    /// The signature does not verify against the given key and message.
    #[error("signature verification failed")]
    BadSignature,

    /// Sealing a payload failed.
    #[error("envelope sealing failed")]
    SealFailure,

    /// Opening a sealed payload failed (wrong key or tampered ciphertext).
    #[error("envelope opening failed")]
    OpenFailure,
}
