//! Public wire types
//!
//! The typed protocol message, its signed envelope-of-envelopes form used on
//! the offline and relay paths, and the mailbox pointer record discovered
//! through the overlay network.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::security::identity;

/// Number of bits of the hashed recipient identity kept in a pointer prefix.
///
/// Shorter prefixes place more recipients behind the same mailbox key,
/// trading discovery recall against query cost and observer anonymity.
pub const DEFAULT_POINTER_PREFIX_BITS: usize = 14;

/// Opaque identifier for a peer, derived from its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Build a NodeId from raw bytes, rejecting anything that is not 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 32] = bytes.try_into().ok()?;
        Some(NodeId(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

/// Protocol message types.
///
/// Values are stable; unknown values from newer peers are dropped by the
/// dispatcher rather than treated as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum MessageType {
    Ping = 1,
    Chat = 2,
    Follow = 3,
    Unfollow = 4,
    ModeratorAdd = 5,
    ModeratorRemove = 6,
    /// Receipt for a delivered mailbox message; the payload is the
    /// acknowledged pointer's content address.
    OfflineAck = 7,
    /// Opaque frame received through a relay server, to be unsealed and
    /// re-dispatched locally.
    OfflineRelay = 8,
    Error = 9,
}

impl MessageType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(MessageType::Ping),
            2 => Some(MessageType::Chat),
            3 => Some(MessageType::Follow),
            4 => Some(MessageType::Unfollow),
            5 => Some(MessageType::ModeratorAdd),
            6 => Some(MessageType::ModeratorRemove),
            7 => Some(MessageType::OfflineAck),
            8 => Some(MessageType::OfflineRelay),
            9 => Some(MessageType::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Errors when encoding, decoding or verifying wire types.
#[derive(Debug)]
pub enum WireError {
    /// Serialization failed
    Encode(String),
    /// Deserialization failed
    Decode(String),
    /// Envelope signature or embedded public key is invalid
    Signature(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Encode(e) => write!(f, "encode failed: {}", e),
            WireError::Decode(e) => write!(f, "decode failed: {}", e),
            WireError::Signature(e) => write!(f, "invalid signature: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

/// A typed, optionally-correlated protocol message.
///
/// `request_id == 0` means fire-and-forget; a non-zero id correlates a
/// request with its reply across a reused stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedMessage {
    pub message_type: MessageType,
    pub request_id: i32,
    pub payload: Vec<u8>,
}

impl TypedMessage {
    /// Create a fire-and-forget message.
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            request_id: 0,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        postcard::to_allocvec(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        postcard::from_bytes(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }
}

/// A [`TypedMessage`] together with the sender's public key and signature.
///
/// This is what actually travels inside a sealed mailbox ciphertext or a
/// relayed frame: the recipient learns and verifies the sender identity from
/// the envelope alone, with no live connection involved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message: TypedMessage,
    /// Sender's public key, DER encoded.
    pub sender_pubkey: Vec<u8>,
    /// Signature over the postcard encoding of `message`.
    pub signature: Vec<u8>,
}

impl MessageEnvelope {
    /// Sign `message` with the local identity.
    pub fn new(
        identity: &crate::security::Identity,
        message: TypedMessage,
    ) -> Result<Self, WireError> {
        let serialized = message.to_bytes()?;
        let signature = identity.sign(&serialized);
        Ok(Self {
            message,
            sender_pubkey: identity.public_key_der(),
            signature,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        postcard::to_allocvec(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        postcard::from_bytes(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }

    /// Verify the signature against the embedded public key and return the
    /// sender's identity derived from that key.
    pub fn verify(&self) -> Result<NodeId, WireError> {
        let serialized = self.message.to_bytes()?;
        identity::verify_signature(&self.sender_pubkey, &serialized, &self.signature)
            .map_err(|e| WireError::Signature(e.to_string()))?;
        Ok(identity::node_id_from_public_key_der(&self.sender_pubkey))
    }
}

/// What a mailbox pointer is published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum PointerPurpose {
    /// An offline message; expires after the message TTL.
    Message = 1,
    /// A moderator listing; republished indefinitely.
    Moderator = 2,
}

impl PointerPurpose {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(PointerPurpose::Message),
            2 => Some(PointerPurpose::Moderator),
            _ => None,
        }
    }
}

/// A published, discoverable mailbox entry referencing where an encrypted
/// message can be fetched.
///
/// Owned by the publisher until expiry or cancellation; read-only to the
/// retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pointer {
    /// Content address of the sealed ciphertext.
    pub content_address: String,
    /// Truncated hash of the recipient identity; the DHT lookup key.
    pub recipient_prefix: Vec<u8>,
    /// Where the ciphertext can be fetched: a content address or an
    /// `https://` URL.
    pub delivery_addresses: Vec<String>,
    pub purpose: PointerPurpose,
    /// Unix timestamp of publication, seconds.
    pub timestamp: i64,
    /// Identity allowed to cancel this pointer via an offline ack.
    pub cancel_id: Option<NodeId>,
}

/// Derive the mailbox lookup prefix for a recipient.
///
/// SHA-256 of the identity, keeping only the leading `prefix_bits` bits and
/// zeroing the rest, so the published key names an anonymity set rather than
/// a single peer.
pub fn pointer_prefix(node_id: &NodeId, prefix_bits: usize) -> Vec<u8> {
    let digest = Sha256::digest(node_id.as_bytes());
    let mut out = digest.as_slice().to_vec();

    let bits = prefix_bits.min(out.len() * 8);
    let full_bytes = bits / 8;
    let partial_bits = bits % 8;

    for (i, byte) in out.iter_mut().enumerate() {
        if i < full_bytes {
            continue;
        }
        if i == full_bytes && partial_bits > 0 {
            *byte &= 0xFF << (8 - partial_bits);
        } else {
            *byte = 0;
        }
    }
    out
}
