//! Cryptography: the mailbox envelope codec and the local RSA identity.
//!
//! - `envelope`: seal/unseal a byte payload for an offline recipient
//! - `identity`: key pair handling, NodeId derivation, envelope signatures

pub mod envelope;
pub mod identity;

pub use envelope::{seal, unseal, EnvelopeError, ENVELOPE_VERSION};
pub use identity::{Identity, IdentityError};
