//! The signed mesh envelope.
//!
//! Wire layout uses a fixed field order: `type, senderId, senderPublicKey,
//! messageId, timestamp, ttl, nonce, payload, signature`, compact JSON.
//! The signature covers those bytes minus `signature` and minus `ttl`:
//! relays decrement the TTL in flight, so it cannot sit under the original
//! signer's signature.

use std::{fmt, str::FromStr};

use edgecoder_crypto::{verify_signature, IdentityKey};
use edgecoder_primitives::{now_millis, AgentId, Buf32, Buf64, MessageId};
use serde::{
    de::{self, MapAccess, Visitor},
    ser::SerializeStruct,
    Deserialize, Deserializer, Serialize, Serializer,
};
use uuid::Uuid;

use crate::{MeshPayload, ProtocolError};

/// The envelope `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PeerAnnounce,
    QueueSummary,
    TaskOffer,
    TaskClaim,
    ClaimRejected,
    ResultAnnounce,
    OrderingSnapshot,
    BlacklistUpdate,
    IssuanceProposal,
    IssuanceVote,
    IssuanceCommit,
    IssuanceCheckpoint,
    CapabilitySummary,
    TaskForward,
    PriceProposal,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerAnnounce => "peer_announce",
            Self::QueueSummary => "queue_summary",
            Self::TaskOffer => "task_offer",
            Self::TaskClaim => "task_claim",
            Self::ClaimRejected => "claim_rejected",
            Self::ResultAnnounce => "result_announce",
            Self::OrderingSnapshot => "ordering_snapshot",
            Self::BlacklistUpdate => "blacklist_update",
            Self::IssuanceProposal => "issuance_proposal",
            Self::IssuanceVote => "issuance_vote",
            Self::IssuanceCommit => "issuance_commit",
            Self::IssuanceCheckpoint => "issuance_checkpoint",
            Self::CapabilitySummary => "capability_summary",
            Self::TaskForward => "task_forward",
            Self::PriceProposal => "price_proposal",
        }
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "peer_announce" => Self::PeerAnnounce,
            "queue_summary" => Self::QueueSummary,
            "task_offer" => Self::TaskOffer,
            "task_claim" => Self::TaskClaim,
            "claim_rejected" => Self::ClaimRejected,
            "result_announce" => Self::ResultAnnounce,
            "ordering_snapshot" => Self::OrderingSnapshot,
            "blacklist_update" => Self::BlacklistUpdate,
            "issuance_proposal" => Self::IssuanceProposal,
            "issuance_vote" => Self::IssuanceVote,
            "issuance_commit" => Self::IssuanceCommit,
            "issuance_checkpoint" => Self::IssuanceCheckpoint,
            "capability_summary" => Self::CapabilitySummary,
            "task_forward" => Self::TaskForward,
            "price_proposal" => Self::PriceProposal,
            other => return Err(ProtocolError::UnknownMessageType(other.to_owned())),
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signed message exchanged between mesh peers.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshEnvelope {
    pub sender_id: AgentId,
    pub sender_public_key: Buf32,
    pub message_id: MessageId,
    pub timestamp: u64,
    pub ttl: u32,
    pub nonce: String,
    pub payload: MeshPayload,
    pub signature: Buf64,
}

impl MeshEnvelope {
    /// Builds and signs a fresh envelope. The message id and nonce are
    /// generated; the timestamp is the current wall clock.
    pub fn create(
        key: &IdentityKey,
        sender_id: AgentId,
        ttl: u32,
        payload: MeshPayload,
    ) -> Result<Self, ProtocolError> {
        let mut envelope = Self {
            sender_id,
            sender_public_key: key.public_key(),
            message_id: MessageId::generate(),
            timestamp: now_millis(),
            ttl,
            nonce: Uuid::new_v4().to_string(),
            payload,
            signature: Buf64::zero(),
        };
        envelope.signature = key.sign(&envelope.signing_bytes()?);
        Ok(envelope)
    }

    /// The canonical bytes the sender signs: fixed field order, compact
    /// JSON, `signature` and `ttl` excluded.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct SigningView<'a> {
            r#type: &'static str,
            sender_id: &'a AgentId,
            sender_public_key: &'a Buf32,
            message_id: &'a MessageId,
            timestamp: u64,
            nonce: &'a str,
            payload: &'a MeshPayload,
        }

        Ok(serde_json::to_vec(&SigningView {
            r#type: self.payload.kind().as_str(),
            sender_id: &self.sender_id,
            sender_public_key: &self.sender_public_key,
            message_id: &self.message_id,
            timestamp: self.timestamp,
            nonce: &self.nonce,
            payload: &self.payload,
        })?)
    }

    /// Verifies the envelope signature against its own sender key.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        verify_signature(
            &self.sender_public_key,
            &self.signing_bytes()?,
            &self.signature,
        )?;
        Ok(())
    }

    /// Copy for relaying with the TTL decremented. The original signature
    /// is preserved. Fails once the TTL cannot support another hop.
    pub fn relayed(&self) -> Result<Self, ProtocolError> {
        if self.ttl <= 1 {
            return Err(ProtocolError::TtlExhausted);
        }
        let mut next = self.clone();
        next.ttl -= 1;
        Ok(next)
    }
}

impl Serialize for MeshEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("MeshEnvelope", 9)?;
        s.serialize_field("type", self.payload.kind().as_str())?;
        s.serialize_field("senderId", &self.sender_id)?;
        s.serialize_field("senderPublicKey", &self.sender_public_key)?;
        s.serialize_field("messageId", &self.message_id)?;
        s.serialize_field("timestamp", &self.timestamp)?;
        s.serialize_field("ttl", &self.ttl)?;
        s.serialize_field("nonce", &self.nonce)?;
        s.serialize_field("payload", &self.payload)?;
        s.serialize_field("signature", &self.signature)?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for MeshEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EnvelopeVisitor;

        impl<'de> Visitor<'de> for EnvelopeVisitor {
            type Value = MeshEnvelope;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mesh envelope object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut kind: Option<String> = None;
                let mut sender_id: Option<AgentId> = None;
                let mut sender_public_key: Option<Buf32> = None;
                let mut message_id: Option<MessageId> = None;
                let mut timestamp: Option<u64> = None;
                let mut ttl: Option<u32> = None;
                let mut nonce: Option<String> = None;
                let mut payload: Option<serde_json::Value> = None;
                let mut signature: Option<Buf64> = None;

                while let Some(field) = map.next_key::<String>()? {
                    match field.as_str() {
                        "type" => kind = Some(map.next_value()?),
                        "senderId" => sender_id = Some(map.next_value()?),
                        "senderPublicKey" => sender_public_key = Some(map.next_value()?),
                        "messageId" => message_id = Some(map.next_value()?),
                        "timestamp" => timestamp = Some(map.next_value()?),
                        "ttl" => ttl = Some(map.next_value()?),
                        "nonce" => nonce = Some(map.next_value()?),
                        "payload" => payload = Some(map.next_value()?),
                        "signature" => signature = Some(map.next_value()?),
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }

                let kind = kind.ok_or_else(|| de::Error::missing_field("type"))?;
                let kind = MessageKind::from_str(&kind).map_err(de::Error::custom)?;
                let payload = payload.ok_or_else(|| de::Error::missing_field("payload"))?;
                let payload = MeshPayload::from_value(kind, payload).map_err(de::Error::custom)?;

                Ok(MeshEnvelope {
                    sender_id: sender_id.ok_or_else(|| de::Error::missing_field("senderId"))?,
                    sender_public_key: sender_public_key
                        .ok_or_else(|| de::Error::missing_field("senderPublicKey"))?,
                    message_id: message_id
                        .ok_or_else(|| de::Error::missing_field("messageId"))?,
                    timestamp: timestamp.ok_or_else(|| de::Error::missing_field("timestamp"))?,
                    ttl: ttl.ok_or_else(|| de::Error::missing_field("ttl"))?,
                    nonce: nonce.ok_or_else(|| de::Error::missing_field("nonce"))?,
                    payload,
                    signature: signature
                        .ok_or_else(|| de::Error::missing_field("signature"))?,
                })
            }
        }

        deserializer.deserialize_map(EnvelopeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use edgecoder_primitives::CoordinatorId;

    use super::*;
    use crate::{OrderingSnapshot, QueueSummary};

    fn sample_payload() -> MeshPayload {
        MeshPayload::QueueSummary(QueueSummary {
            coordinator_id: CoordinatorId::new("c1"),
            queued_tasks: 3,
            active_agents: 2,
        })
    }

    #[test]
    fn create_then_verify() {
        let key = IdentityKey::generate();
        let envelope =
            MeshEnvelope::create(&key, AgentId::new("a1"), 3, sample_payload()).unwrap();
        envelope.verify().unwrap();
    }

    #[test]
    fn wire_round_trip_preserves_signature() {
        let key = IdentityKey::generate();
        let envelope =
            MeshEnvelope::create(&key, AgentId::new("a1"), 3, sample_payload()).unwrap();
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: MeshEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
        parsed.verify().unwrap();
    }

    #[test]
    fn wire_field_order_is_fixed() {
        let key = IdentityKey::generate();
        let envelope =
            MeshEnvelope::create(&key, AgentId::new("a1"), 3, sample_payload()).unwrap();
        let json = serde_json::to_string(&envelope).unwrap();
        let type_pos = json.find("\"type\"").unwrap();
        let sender_pos = json.find("\"senderId\"").unwrap();
        let ttl_pos = json.find("\"ttl\"").unwrap();
        let sig_pos = json.find("\"signature\"").unwrap();
        assert!(type_pos < sender_pos && sender_pos < ttl_pos && ttl_pos < sig_pos);
    }

    #[test]
    fn relay_decrements_ttl_and_keeps_signature_valid() {
        let key = IdentityKey::generate();
        let envelope =
            MeshEnvelope::create(&key, AgentId::new("a1"), 3, sample_payload()).unwrap();
        let relayed = envelope.relayed().unwrap();
        assert_eq!(relayed.ttl, 2);
        relayed.verify().unwrap();
    }

    #[test]
    fn relay_stops_at_ttl_one() {
        let key = IdentityKey::generate();
        let envelope =
            MeshEnvelope::create(&key, AgentId::new("a1"), 1, sample_payload()).unwrap();
        assert!(matches!(
            envelope.relayed(),
            Err(ProtocolError::TtlExhausted)
        ));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let key = IdentityKey::generate();
        let mut envelope =
            MeshEnvelope::create(&key, AgentId::new("a1"), 3, sample_payload()).unwrap();
        envelope.payload = MeshPayload::OrderingSnapshot(OrderingSnapshot {
            coordinator_id: CoordinatorId::new("c1"),
            head_hash: Buf32::zero(),
            sequence_number: 1,
        });
        assert!(envelope.verify().is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let err = serde_json::from_str::<MeshEnvelope>(
            r#"{"type":"bogus","senderId":"a1","senderPublicKey":"00","messageId":"m","timestamp":1,"ttl":1,"nonce":"n","payload":{},"signature":"00"}"#,
        );
        assert!(err.is_err());
    }
}
