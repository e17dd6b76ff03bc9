//! Hybrid-encryption envelope codec
//!
//! Seals a byte payload for a recipient's public key so it can sit in an
//! untrusted mailbox until fetched:
//!
//! ```text
//! envelope = version(4, BE) ‖ encrypted_secret_key(256) ‖ iv(16) ‖ ciphertext ‖ mac(32)
//! ```
//!
//! A random 32-byte secret key is wrapped with the recipient's RSA key; the
//! AES and MAC keys are derived from it with HKDF-SHA-256 under a fixed salt.
//! The payload is AES-256-CFB encrypted and authenticated with HMAC-SHA-256
//! over `iv ‖ ciphertext`. Unsealing verifies the MAC before any decryption.
//!
//! Only version 1 is defined; decoding dispatches on the version field so the
//! algorithm can be upgraded without breaking old envelopes.

use aes::Aes256;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Envelope format version. Only 1 is defined.
pub const ENVELOPE_VERSION: u32 = 1;

/// Length of the serialized version field in bytes.
pub const VERSION_BYTES: usize = 4;

/// Length of the random secret key the AES and MAC keys are derived from.
pub const SECRET_KEY_BYTES: usize = 32;

/// Length of the RSA-encrypted secret key. Fixed by the 2048-bit identity
/// key size.
pub const ENCRYPTED_SECRET_KEY_BYTES: usize = 256;

/// AES block size; the IV length.
pub const IV_BYTES: usize = 16;

/// Length of the HMAC-SHA-256 tag.
pub const MAC_BYTES: usize = 32;

/// Fixed HKDF salt for key derivation.
pub const HKDF_SALT: &[u8] = b"OpenBazaar Encryption Algorithm";

/// Errors when sealing or unsealing an envelope.
#[derive(Debug)]
pub enum EnvelopeError {
    /// Buffer is shorter than the fixed envelope framing
    ShortCiphertext,
    /// Version field names an undefined format version
    UnknownVersion(u32),
    /// Recomputed MAC does not match the trailing MAC
    InvalidMac,
    /// RSA encryption or key handling failed while sealing
    Encrypt(String),
    /// RSA decryption failed while unsealing
    Decrypt(String),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::ShortCiphertext => write!(f, "ciphertext is too short"),
            EnvelopeError::UnknownVersion(v) => write!(f, "unknown envelope version {}", v),
            EnvelopeError::InvalidMac => write!(f, "invalid hmac"),
            EnvelopeError::Encrypt(e) => write!(f, "encrypt failed: {}", e),
            EnvelopeError::Decrypt(e) => write!(f, "decrypt failed: {}", e),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// AES and MAC keys derived from the wrapped secret key.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKeys {
    aes: [u8; 32],
    mac: [u8; 32],
}

fn derive_keys(secret_key: &[u8]) -> Result<DerivedKeys, EnvelopeError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret_key);
    let mut okm = [0u8; 64];
    hk.expand(&[], &mut okm)
        .map_err(|e| EnvelopeError::Encrypt(e.to_string()))?;

    let mut keys = DerivedKeys {
        aes: [0u8; 32],
        mac: [0u8; 32],
    };
    keys.aes.copy_from_slice(&okm[..32]);
    keys.mac.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok(keys)
}

fn compute_mac(mac_key: &[u8; 32], iv_and_ciphertext: &[u8]) -> Result<[u8; 32], EnvelopeError> {
    let mut mac = HmacSha256::new_from_slice(mac_key)
        .map_err(|e| EnvelopeError::Encrypt(e.to_string()))?;
    mac.update(iv_and_ciphertext);
    Ok(mac.finalize().into_bytes().into())
}

/// Seal `plaintext` for the holder of `recipient_key`.
pub fn seal(recipient_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut secret_key = [0u8; SECRET_KEY_BYTES];
    OsRng.fill_bytes(&mut secret_key);

    let encrypted_secret_key = recipient_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, &secret_key)
        .map_err(|e| EnvelopeError::Encrypt(e.to_string()))?;
    if encrypted_secret_key.len() != ENCRYPTED_SECRET_KEY_BYTES {
        secret_key.zeroize();
        return Err(EnvelopeError::Encrypt(format!(
            "unexpected wrapped key length {} (recipient key is not 2048 bits)",
            encrypted_secret_key.len()
        )));
    }

    let keys = derive_keys(&secret_key)?;
    secret_key.zeroize();

    let mut iv = [0u8; IV_BYTES];
    OsRng.fill_bytes(&mut iv);

    let mut ciphertext = plaintext.to_vec();
    Aes256CfbEnc::new(&keys.aes.into(), &iv.into()).encrypt(&mut ciphertext);

    // MAC covers iv ‖ ciphertext, exactly the region between the wrapped key
    // and the trailing tag.
    let mut body = Vec::with_capacity(IV_BYTES + ciphertext.len());
    body.extend_from_slice(&iv);
    body.extend_from_slice(&ciphertext);
    let tag = compute_mac(&keys.mac, &body)?;

    let mut envelope =
        Vec::with_capacity(VERSION_BYTES + ENCRYPTED_SECRET_KEY_BYTES + body.len() + MAC_BYTES);
    envelope.extend_from_slice(&ENVELOPE_VERSION.to_be_bytes());
    envelope.extend_from_slice(&encrypted_secret_key);
    envelope.extend_from_slice(&body);
    envelope.extend_from_slice(&tag);
    Ok(envelope)
}

/// Unseal an envelope with the recipient's private key.
pub fn unseal(private_key: &RsaPrivateKey, envelope: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if envelope.len() < VERSION_BYTES + ENCRYPTED_SECRET_KEY_BYTES + IV_BYTES + MAC_BYTES {
        return Err(EnvelopeError::ShortCiphertext);
    }

    let version = u32::from_be_bytes([envelope[0], envelope[1], envelope[2], envelope[3]]);
    match version {
        ENVELOPE_VERSION => unseal_v1(private_key, envelope),
        other => Err(EnvelopeError::UnknownVersion(other)),
    }
}

fn unseal_v1(private_key: &RsaPrivateKey, envelope: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let key_end = VERSION_BYTES + ENCRYPTED_SECRET_KEY_BYTES;
    let mac_start = envelope.len() - MAC_BYTES;

    let mut secret_key = private_key
        .decrypt(Pkcs1v15Encrypt, &envelope[VERSION_BYTES..key_end])
        .map_err(|e| EnvelopeError::Decrypt(e.to_string()))?;
    let keys = derive_keys(&secret_key)?;
    secret_key.zeroize();

    // Verify before any decryption.
    let body = &envelope[key_end..mac_start];
    let mut mac = HmacSha256::new_from_slice(&keys.mac)
        .map_err(|e| EnvelopeError::Decrypt(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&envelope[mac_start..])
        .map_err(|_| EnvelopeError::InvalidMac)?;

    let iv: [u8; IV_BYTES] = body[..IV_BYTES]
        .try_into()
        .map_err(|_| EnvelopeError::ShortCiphertext)?;
    let mut plaintext = body[IV_BYTES..].to_vec();
    Aes256CfbDec::new(&keys.aes.into(), &iv.into()).decrypt(&mut plaintext);
    Ok(plaintext)
}
