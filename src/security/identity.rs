//! Local node identity
//!
//! An RSA-2048 key pair plus the [`NodeId`] derived from the public key.
//! The key pair both receives sealed envelopes and signs outgoing message
//! envelopes so offline recipients can authenticate the sender.

use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Digest;

use crate::protocol::types::NodeId;

/// Identity key size in bits. Fixes the envelope's wrapped-key length.
pub const IDENTITY_KEY_BITS: usize = 2048;

/// Errors when creating or using an identity.
#[derive(Debug)]
pub enum IdentityError {
    /// Key generation or parsing failed
    Key(String),
    /// Signature verification failed
    Signature(String),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Key(e) => write!(f, "key error: {}", e),
            IdentityError::Signature(e) => write!(f, "signature error: {}", e),
        }
    }
}

impl std::error::Error for IdentityError {}

/// The local node's key pair and derived identifier.
#[derive(Clone)]
pub struct Identity {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    node_id: NodeId,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl Identity {
    /// Generate a fresh identity. Expensive; done once per node lifetime.
    pub fn generate() -> Result<Self, IdentityError> {
        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, IDENTITY_KEY_BITS)
            .map_err(|e| IdentityError::Key(e.to_string()))?;
        Self::from_private_key(private_key)
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, IdentityError> {
        let public_key = RsaPublicKey::from(&private_key);
        let der = public_key
            .to_public_key_der()
            .map_err(|e| IdentityError::Key(e.to_string()))?;
        let node_id = node_id_from_public_key_der(der.as_bytes());
        Ok(Self {
            private_key,
            public_key,
            node_id,
        })
    }

    /// Restore an identity from a PKCS#8 DER private key blob.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, IdentityError> {
        let private_key =
            RsaPrivateKey::from_pkcs8_der(der).map_err(|e| IdentityError::Key(e.to_string()))?;
        Self::from_private_key(private_key)
    }

    /// Export the private key as PKCS#8 DER for persistence.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, IdentityError> {
        Ok(self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| IdentityError::Key(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// DER encoding of the public key, as embedded in message envelopes.
    pub fn public_key_der(&self) -> Vec<u8> {
        // A key that produced this identity always re-encodes.
        self.public_key
            .to_public_key_der()
            .map(|d| d.as_bytes().to_vec())
            .unwrap_or_default()
    }

    /// Sign a message with RSA PKCS#1 v1.5 / SHA-256.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        signing_key.sign(message).to_vec()
    }
}

/// Derive a [`NodeId`] from a DER-encoded public key.
pub fn node_id_from_public_key_der(der: &[u8]) -> NodeId {
    let digest = sha2::Sha256::digest(der);
    NodeId(digest.into())
}

/// Verify an envelope signature against a DER-encoded public key.
pub fn verify_signature(
    public_key_der: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let public_key = RsaPublicKey::from_public_key_der(public_key_der)
        .map_err(|e| IdentityError::Key(e.to_string()))?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let signature =
        Signature::try_from(signature).map_err(|e| IdentityError::Signature(e.to_string()))?;
    verifying_key
        .verify(message, &signature)
        .map_err(|e| IdentityError::Signature(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_identity;

    #[test]
    fn test_sign_verify_round_trip() {
        let identity = test_identity(0);
        let message = b"signed for an offline recipient";

        let signature = identity.sign(message);
        verify_signature(&identity.public_key_der(), message, &signature).unwrap();
    }

    #[test]
    fn test_verify_rejects_altered_message() {
        let identity = test_identity(0);
        let signature = identity.sign(b"original");
        assert!(verify_signature(&identity.public_key_der(), b"altered", &signature).is_err());
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let signer = test_identity(0);
        let other = test_identity(1);

        let signature = signer.sign(b"message");
        assert!(verify_signature(&other.public_key_der(), b"message", &signature).is_err());
    }

    #[test]
    fn test_node_id_is_stable_across_der_round_trip() {
        let identity = test_identity(0);
        let der = identity.to_pkcs8_der().unwrap();
        let restored = Identity::from_pkcs8_der(&der).unwrap();
        assert_eq!(restored.node_id(), identity.node_id());
    }

    #[test]
    fn test_distinct_keys_get_distinct_ids() {
        assert_ne!(test_identity(0).node_id(), test_identity(1).node_id());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let identity = test_identity(0);
        let debug = format!("{:?}", identity);
        assert!(debug.contains("[REDACTED]"));
    }
}
