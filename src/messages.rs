//! # Control Payloads
//!
//! Serializable bodies carried over peer channels and routed messages.
//! Encoded with bincode (fixed-width integers); decoding always goes through
//! [`deserialize_bounded`] so a hostile length prefix cannot exhaust memory.
//!
//! | Channel | Type |
//! |---------|------|
//! | Peer handshake (port 0 before bootstrap) | [`PeerInit`] |
//! | Network init (peer port 0) | [`NetworkBindings`] |
//! | Broker (peer port 1) | [`BrokerMessage`] |
//! | HashTable (network port 10) | [`HashTableMessage`] |
//! | PeerIndex (network port 11) | [`PeerIndexMessage`] |
//! | PeerExchange (network port 12) | [`PeerExchangeMessage`] |

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::certificate::Certificate;
use crate::identity::{HostId, PublicKey};

/// Maximum buffer size for deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = 1024 * 1024 + 4096;

/// Version carried in [`PeerInit`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Peer Handshake
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInit {
    pub protocol_version: u32,
    /// Host certificate with the profile certificate as parent.
    pub certificate: Certificate,
    pub discriminator: u16,
}

// ============================================================================
// Bootstrap
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBinding {
    /// Peer port the sender installed for this network.
    pub port: u32,
    /// Sender's membership certificate.
    pub certificate: Certificate,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBindings {
    /// Set on the answer to a peer's bindings; answers are never answered.
    pub is_reply: bool,
    pub bindings: Vec<NetworkBinding>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerMessage {
    Init { key_count: u32, discriminator: u16 },
    /// Salted digests of the sender's network keys.
    Digests { salt: [u8; 32], digests: Vec<[u8; 32]> },
}

// ============================================================================
// HashTable
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashTableRecord {
    pub key: PublicKey,
    pub salt: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashTableMessage {
    Publish(HashTableRecord),
    Unpublish(HashTableRecord),
    GetRequest { request_id: u64, hash: [u8; 32] },
    GetResponse { request_id: u64, record: HashTableRecord },
}

// ============================================================================
// PeerIndex
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIndexRecord {
    pub hash: [u8; 32],
    pub key: PublicKey,
    pub host_id: HostId,
    pub port: u32,
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerIndexMessage {
    Publish(PeerIndexRecord),
    Unpublish(PeerIndexRecord),
    SearchRequest { request_id: u64, hash: [u8; 32] },
    SearchResponse { request_id: u64, records: Vec<PeerIndexRecord> },
}

// ============================================================================
// PeerExchange
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerExchangeMessage {
    MediationOffer {
        mediation_id: u64,
        data: Vec<u8>,
    },
    MediationAnswer {
        mediation_id: u64,
        data: Vec<u8>,
    },
    /// `data == None` terminates the candidate list at `index`.
    MediationIceCandidate {
        mediation_id: u64,
        index: u64,
        data: Option<Vec<u8>>,
    },
    CallbackRequest,
    Rejection {
        mediation_id: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_decoder_rejects_oversized_length() {
        // A Vec length prefix claiming far more than the limit.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u32.to_le_bytes()); // enum variant SearchResponse
        bytes.extend_from_slice(&7u64.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(deserialize_bounded::<PeerIndexMessage>(&bytes).is_err());
    }

    #[test]
    fn ice_candidate_terminator_survives_encoding() {
        let msg = PeerExchangeMessage::MediationIceCandidate {
            mediation_id: 9,
            index: 2,
            data: None,
        };
        let decoded: PeerExchangeMessage = deserialize_bounded(&serialize(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let msg = HashTableMessage::GetRequest {
            request_id: 1,
            hash: [7u8; 32],
        };
        let bytes = serialize(&msg).unwrap();
        assert!(deserialize_bounded::<HashTableMessage>(&bytes[..bytes.len() - 1]).is_err());
    }
}
