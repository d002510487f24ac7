//! Ed25519 identity keys.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use edgecoder_primitives::{Buf32, Buf64};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// A 32-byte Ed25519 seed, zeroized on drop. Used when loading identity
/// material from disk or config.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeySeed([u8; 32]);

impl KeySeed {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for KeySeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySeed(..)")
    }
}

/// The node's Ed25519 identity key.
pub struct IdentityKey {
    signing: SigningKey,
}

impl IdentityKey {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &KeySeed) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed.0),
        }
    }

    /// The public half, as carried in mesh envelopes.
    pub fn public_key(&self) -> Buf32 {
        Buf32::new(self.signing.verifying_key().to_bytes())
    }

    /// Signs arbitrary bytes, returning a detached signature.
    pub fn sign(&self, msg: &[u8]) -> Buf64 {
        Buf64::new(self.signing.sign(msg).to_bytes())
    }
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityKey({})", self.public_key())
    }
}

/// Verifies a detached signature against a public key and message.
pub fn verify_signature(
    public_key: &Buf32,
    msg: &[u8],
    signature: &Buf64,
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public_key.as_bytes())
        .map_err(|_| CryptoError::MalformedPublicKey)?;
    let sig = Signature::from_bytes(signature.as_bytes());
    key.verify_strict(msg, &sig)
        .map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let key = IdentityKey::generate();
        let sig = key.sign(b"payload");
        verify_signature(&key.public_key(), b"payload", &sig).unwrap();
    }

    #[test]
    fn tampered_message_fails() {
        let key = IdentityKey::generate();
        let sig = key.sign(b"payload");
        let err = verify_signature(&key.public_key(), b"payloae", &sig);
        assert!(matches!(err, Err(CryptoError::BadSignature)));
    }

    #[test]
    fn wrong_key_fails() {
        let key = IdentityKey::generate();
        let other = IdentityKey::generate();
        let sig = key.sign(b"payload");
        let err = verify_signature(&other.public_key(), b"payload", &sig);
        assert!(matches!(err, Err(CryptoError::BadSignature)));
    }

    #[test]
    fn seed_is_deterministic() {
        let seed = KeySeed::new([7; 32]);
        let a = IdentityKey::from_seed(&seed);
        let b = IdentityKey::from_seed(&KeySeed::new([7; 32]));
        assert_eq!(a.public_key(), b.public_key());
    }
}
