//! Signing, replay protection, and rate limiting primitives.
//!
//! Every node holds an Ed25519 identity key. All mesh messages are signed
//! with it and verified against the sender's advertised public key. The
//! nonce cache and rate limiter back the gossip receive pipeline. The
//! sealed-envelope interface (X25519 ECDH + AES-256-GCM) is reserved for
//! messages that need confidentiality on top of authenticity.

mod errors;
mod keys;
mod nonce;
mod rate;
mod sealed;

pub use errors::CryptoError;
pub use keys::{verify_signature, IdentityKey, KeySeed};
pub use nonce::NonceCache;
pub use rate::RateLimiter;
pub use sealed::{open_envelope, seal_envelope, SealedEnvelope, SealingKey};
