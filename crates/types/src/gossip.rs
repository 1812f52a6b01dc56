//! Gossip message envelope.
//!
//! The core does not own a transport; it produces and consumes these
//! signed envelopes through the network layer's ingress/egress queues.
//! Every envelope carries its type, an opaque payload, the sender's node
//! id (an Ed25519 public key), a timestamp, a hash message id, a TTL, and
//! a signature over the canonical encoding.

use crate::error::{CoreError, CoreResult};
use logichain_crypto::{
    sha256, ByteReader, ByteWriter, Keypair, PublicKey, SignatureScheme, SIGNATURE_BYTES,
};
use serde::{Deserialize, Serialize};

/// Initial time-to-live of a freshly published envelope.
pub const GOSSIP_TTL: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GossipType {
    Block,
    Transaction,
    PeerDiscovery,
    SyncRequest,
    SyncResponse,
    FallbackRequest,
    Ack,
}

impl GossipType {
    pub fn as_byte(self) -> u8 {
        match self {
            GossipType::Block => 0,
            GossipType::Transaction => 1,
            GossipType::PeerDiscovery => 2,
            GossipType::SyncRequest => 3,
            GossipType::SyncResponse => 4,
            GossipType::FallbackRequest => 5,
            GossipType::Ack => 6,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(GossipType::Block),
            1 => Some(GossipType::Transaction),
            2 => Some(GossipType::PeerDiscovery),
            3 => Some(GossipType::SyncRequest),
            4 => Some(GossipType::SyncResponse),
            5 => Some(GossipType::FallbackRequest),
            6 => Some(GossipType::Ack),
            _ => None,
        }
    }
}

/// A signed gossip envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub msg_type: GossipType,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Sender node id: the Ed25519 key the signature verifies under.
    pub sender: [u8; 32],
    pub timestamp: f64,
    pub message_id: [u8; 32],
    pub ttl: u8,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl GossipMessage {
    /// Build and sign an envelope with the node's Ed25519 identity key.
    pub fn new(
        msg_type: GossipType,
        payload: Vec<u8>,
        timestamp: f64,
        node_key: &Keypair,
    ) -> CoreResult<Self> {
        let public = node_key.public_key();
        if public.scheme != SignatureScheme::Ed25519 {
            return Err(CoreError::InvalidSignature);
        }
        let mut sender = [0u8; 32];
        sender.copy_from_slice(&public.bytes);

        let mut message = Self {
            msg_type,
            payload,
            sender,
            timestamp,
            message_id: [0; 32],
            ttl: GOSSIP_TTL,
            signature: vec![0u8; SIGNATURE_BYTES],
        };
        message.message_id = sha256(&message.signing_bytes());
        message.signature = node_key.sign(&message.signing_bytes()).to_vec();
        Ok(message)
    }

    /// Canonical bytes covered by the signature and the message id.
    /// The TTL is excluded: relays decrement it without re-signing.
    fn signing_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(64 + self.payload.len());
        writer.put_u8(self.msg_type.as_byte());
        writer.put_bytes(&self.payload);
        writer.put_raw(&self.sender);
        writer.put_f64(self.timestamp);
        writer.into_bytes()
    }

    /// Verify the id and signature against the embedded sender key.
    pub fn verify(&self) -> CoreResult<()> {
        if self.message_id != sha256(&self.signing_bytes()) {
            return Err(CoreError::InvalidBlockStructure(
                "gossip message id mismatch".into(),
            ));
        }
        let key = PublicKey::from_bytes(SignatureScheme::Ed25519, &self.sender)?;
        key.verify(&self.signing_bytes(), &self.signature)?;
        Ok(())
    }

    /// Consume one hop; `None` when the envelope must not be relayed.
    pub fn relay(&self) -> Option<Self> {
        if self.ttl <= 1 {
            return None;
        }
        let mut next = self.clone();
        next.ttl -= 1;
        Some(next)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(112 + self.payload.len());
        writer.put_u8(self.msg_type.as_byte());
        writer.put_bytes(&self.payload);
        writer.put_raw(&self.sender);
        writer.put_f64(self.timestamp);
        writer.put_raw(&self.message_id);
        writer.put_u8(self.ttl);
        writer.put_raw(&self.signature);
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let msg_type = GossipType::from_byte(reader.get_u8()?)
            .ok_or_else(|| CoreError::InvalidBlockStructure("unknown gossip type".into()))?;
        let payload = reader.get_bytes()?.to_vec();
        let sender = reader.get_array()?;
        let timestamp = reader.get_f64()?;
        let message_id = reader.get_array()?;
        let ttl = reader.get_u8()?;
        let signature = reader.get_raw(SIGNATURE_BYTES)?.to_vec();
        if !reader.is_exhausted() {
            return Err(CoreError::InvalidBlockStructure(
                "trailing bytes after gossip message".into(),
            ));
        }
        Ok(Self {
            msg_type,
            payload,
            sender,
            timestamp,
            message_id,
            ttl,
            signature,
        })
    }
}

/// Payload of a SYNC_REQUEST envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub from_height: u64,
    pub to_height: u64,
}

impl SyncRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(16);
        writer.put_u64(self.from_height);
        writer.put_u64(self.to_height);
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let request = Self {
            from_height: reader.get_u64()?,
            to_height: reader.get_u64()?,
        };
        if !reader.is_exhausted() {
            return Err(CoreError::InvalidBlockStructure(
                "trailing bytes in sync request".into(),
            ));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_key() -> Keypair {
        Keypair::generate(SignatureScheme::Ed25519)
    }

    #[test]
    fn envelope_roundtrip_and_verify() {
        let key = node_key();
        let message =
            GossipMessage::new(GossipType::Block, vec![1, 2, 3], 1_700_000_000.0, &key).unwrap();
        message.verify().unwrap();

        let decoded = GossipMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
        decoded.verify().unwrap();
    }

    #[test]
    fn tampered_payload_rejected() {
        let key = node_key();
        let mut message =
            GossipMessage::new(GossipType::Transaction, vec![1], 0.0, &key).unwrap();
        message.payload = vec![2];
        assert!(message.verify().is_err());
    }

    #[test]
    fn relay_decrements_and_stops_at_one() {
        let key = node_key();
        let message = GossipMessage::new(GossipType::Ack, Vec::new(), 0.0, &key).unwrap();
        assert_eq!(message.ttl, GOSSIP_TTL);

        let hop1 = message.relay().unwrap();
        assert_eq!(hop1.ttl, GOSSIP_TTL - 1);
        // Relayed envelopes still verify: the TTL is outside the signature.
        hop1.verify().unwrap();

        let hop2 = hop1.relay().unwrap();
        assert_eq!(hop2.ttl, 1);
        assert!(hop2.relay().is_none());
    }

    #[test]
    fn ecdsa_node_identity_refused() {
        let key = Keypair::generate(SignatureScheme::EcdsaSecp256k1);
        assert!(GossipMessage::new(GossipType::Ack, Vec::new(), 0.0, &key).is_err());
    }

    #[test]
    fn sync_request_roundtrip() {
        let request = SyncRequest {
            from_height: 10,
            to_height: 42,
        };
        assert_eq!(SyncRequest::decode(&request.encode()).unwrap(), request);
    }
}
