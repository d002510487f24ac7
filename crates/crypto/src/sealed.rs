//! Envelope encryption for confidential inter-node messages.
//!
//! X25519 ECDH against the recipient's sealing key derives a shared secret;
//! the SHA-256 of that secret keys AES-256-GCM with a fresh per-message
//! nonce. Optional in v1: the mesh itself is signed-but-plaintext, and this
//! interface is used only where confidentiality is explicitly required.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use edgecoder_primitives::{sha256, Buf32};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::CryptoError;

const NONCE_LEN: usize = 12;

/// The recipient half of the sealing exchange.
pub struct SealingKey {
    secret: StaticSecret,
}

impl SealingKey {
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Public key to advertise to senders.
    pub fn public_key(&self) -> Buf32 {
        Buf32::new(PublicKey::from(&self.secret).to_bytes())
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SealingKey({})", self.public_key())
    }
}

/// A sealed payload: ephemeral sender key, AES-GCM nonce, ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub ephemeral_public: Buf32,
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Seals `plaintext` to the holder of `recipient` (an X25519 public key).
pub fn seal_envelope(recipient: &Buf32, plaintext: &[u8]) -> Result<SealedEnvelope, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = Buf32::new(PublicKey::from(&ephemeral).to_bytes());

    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient.as_bytes()));
    let key_bytes = sha256(shared.as_bytes());
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::SealFailure)?;

    Ok(SealedEnvelope {
        ephemeral_public,
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Opens a sealed envelope with the recipient's sealing key.
pub fn open_envelope(key: &SealingKey, envelope: &SealedEnvelope) -> Result<Vec<u8>, CryptoError> {
    if envelope.nonce.len() != NONCE_LEN {
        return Err(CryptoError::OpenFailure);
    }

    let shared = key
        .secret
        .diffie_hellman(&PublicKey::from(*envelope.ephemeral_public.as_bytes()));
    let key_bytes = sha256(shared.as_bytes());
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes.as_bytes()));

    cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_ref())
        .map_err(|_| CryptoError::OpenFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = SealingKey::generate();
        let sealed = seal_envelope(&key.public_key(), b"secret task input").unwrap();
        let opened = open_envelope(&key, &sealed).unwrap();
        assert_eq!(opened, b"secret task input");
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let key = SealingKey::generate();
        let other = SealingKey::generate();
        let sealed = seal_envelope(&key.public_key(), b"secret").unwrap();
        assert!(matches!(
            open_envelope(&other, &sealed),
            Err(CryptoError::OpenFailure)
        ));
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let key = SealingKey::generate();
        let mut sealed = seal_envelope(&key.public_key(), b"secret").unwrap();
        sealed.ciphertext[0] ^= 0xff;
        assert!(matches!(
            open_envelope(&key, &sealed),
            Err(CryptoError::OpenFailure)
        ));
    }
}
