// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Hybrid Encryption Envelope
//!
//! Implements the end-to-end envelope used for every command and response
//! that crosses the relay:
//!
//! - **Key agreement**: X25519 ECDH between a fresh ephemeral keypair and
//!   the recipient's long-lived Ed25519 key converted to its Montgomery
//!   form.
//! - **Key derivation**: HKDF-SHA256 with an info string bound to both
//!   public keys, producing a one-time AES-256 key.
//! - **Sealing**: AES-256-GCM with the ephemeral public key as additional
//!   authenticated data, binding the ciphertext to the key exchange.
//! - **Authentication**: an optional Ed25519 signature over
//!   `ephemeral_public_key || nonce || ciphertext`.
//!
//! The relay in the middle only ever sees an [`EncryptedEnvelope`]; it can
//! forward it but cannot open it or forge a signed one.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::error::CryptoError;
use crate::crypto::wipe::{generate_random_bytes, wipe, SecretBytes};

/// HKDF info label binding derived keys to this protocol.
const KEY_INFO_LABEL: &[u8] = b"veilink-x25519-aes256-gcm";

/// AES-GCM nonce size in bytes.
const NONCE_SIZE: usize = 12;

/// X25519 public key / scalar size in bytes.
const POINT_SIZE: usize = 32;

/// A hybrid-encrypted message.
///
/// The ephemeral key is generated fresh for every envelope and discarded
/// after the shared secret is computed; it is never reused.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// X25519 ephemeral public key (32 bytes).
    pub ephemeral_public_key: Vec<u8>,
    /// 12-byte GCM nonce.
    pub nonce: Vec<u8>,
    /// AES-256-GCM ciphertext with appended authentication tag.
    pub ciphertext: Vec<u8>,
    /// Fingerprint identifying the sender's key/certificate (optional).
    #[serde(default)]
    pub sender_fingerprint: String,
    /// Ed25519 signature over `ephemeral_public_key || nonce || ciphertext`
    /// (empty when the envelope is unsigned).
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Whether the envelope carries a signature.
    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// The byte region covered by the signature.
    fn signed_region(&self) -> Vec<u8> {
        let mut region = Vec::with_capacity(
            self.ephemeral_public_key.len() + self.nonce.len() + self.ciphertext.len(),
        );
        region.extend_from_slice(&self.ephemeral_public_key);
        region.extend_from_slice(&self.nonce);
        region.extend_from_slice(&self.ciphertext);
        region
    }
}

// Small-order points in X25519. Key agreement against any of these leaks
// information about the private key, so conversions that land here abort.
const SMALL_ORDER_POINTS: [[u8; 32]; 7] = [
    // identity
    [
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ],
    // order 4
    [
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ],
    // order 8
    [
        0xec, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // order 8
    [
        0xe0, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f, 0xc4,
        0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16, 0x5f, 0x49,
        0xb8, 0x00,
    ],
    // order 8
    [
        0x5f, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83, 0xef,
        0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd, 0xd0, 0x9f,
        0x11, 0x57,
    ],
    // p-1
    [
        0xed, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p
    [
        0xee, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
];

/// Check whether an X25519 point is in the small-order subgroup.
fn is_small_order_point(point: &[u8; 32]) -> bool {
    SMALL_ORDER_POINTS.iter().any(|sop| sop == point)
}

/// Convert an Ed25519 public key to its X25519 (Montgomery) form.
///
/// # Errors
///
/// Returns [`CryptoError::RejectedPoint`] if the converted point is in the
/// small-order subgroup.
pub fn ed25519_public_to_x25519(key: &VerifyingKey) -> Result<X25519PublicKey, CryptoError> {
    let montgomery = key.to_montgomery().to_bytes();
    if is_small_order_point(&montgomery) {
        return Err(CryptoError::RejectedPoint);
    }
    Ok(X25519PublicKey::from(montgomery))
}

/// Derive the X25519 secret scalar from an Ed25519 signing key.
///
/// The scalar is SHA-512 of the seed, clamped per the Curve25519
/// convention. The unused upper half of the hash still contains key
/// material and is wiped before the buffer drops.
pub fn ed25519_secret_to_x25519(key: &SigningKey) -> StaticSecret {
    let mut hash = Sha512::digest(key.as_bytes());

    let mut clamped = [0u8; POINT_SIZE];
    clamped.copy_from_slice(&hash[..POINT_SIZE]);
    clamped[0] &= 248;
    clamped[31] &= 127;
    clamped[31] |= 64;

    wipe(&mut hash);

    // StaticSecret zeroizes itself on drop.
    StaticSecret::from(clamped)
}

/// HKDF-SHA256 key derivation for the AEAD key.
///
/// Info binds the key to this protocol and to both public keys of the
/// exchange, so a transplanted ciphertext cannot decrypt under a different
/// key pairing.
fn derive_key(
    shared_secret: &[u8],
    ephemeral_public: &[u8],
    recipient_public: &[u8],
) -> Result<SecretBytes<32>, CryptoError> {
    let mut info = Vec::with_capacity(KEY_INFO_LABEL.len() + POINT_SIZE * 2);
    info.extend_from_slice(KEY_INFO_LABEL);
    info.extend_from_slice(ephemeral_public);
    info.extend_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hkdf.expand(&info, &mut okm)
        .map_err(|_| CryptoError::EncryptFailed)?;
    Ok(SecretBytes(okm))
}

/// Encrypt plaintext to a recipient's Ed25519 public key.
///
/// Generates a fresh ephemeral X25519 keypair, computes the shared secret
/// against the recipient's converted key, derives a one-time AES-256 key,
/// and seals the plaintext with the ephemeral public key as AAD.
///
/// # Errors
///
/// - [`CryptoError::RejectedPoint`] if the recipient key converts to a
///   small-order point
/// - [`CryptoError::RandomFailed`] if the system RNG fails
/// - [`CryptoError::EncryptFailed`] if AEAD sealing fails
pub fn encrypt(
    plaintext: &[u8],
    recipient_public: &VerifyingKey,
) -> Result<EncryptedEnvelope, CryptoError> {
    // 1. Convert recipient Ed25519 key to X25519, rejecting weak points
    let recipient_x25519 = ed25519_public_to_x25519(recipient_public)?;

    // 2. Generate ephemeral X25519 keypair (single use)
    let mut ephemeral_bytes = [0u8; POINT_SIZE];
    OsRng
        .try_fill_bytes(&mut ephemeral_bytes)
        .map_err(|_| CryptoError::RandomFailed)?;
    let ephemeral_secret = StaticSecret::from(ephemeral_bytes);
    wipe(&mut ephemeral_bytes);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    // 3. Compute shared secret (zeroized on drop)
    let shared_secret = ephemeral_secret.diffie_hellman(&recipient_x25519);

    // 4. Derive one-time AES-256 key
    let aes_key = derive_key(
        shared_secret.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient_x25519.as_bytes(),
    )?;

    // 5. Seal with a random nonce; AAD binds ciphertext to the exchange
    let nonce_bytes = generate_random_bytes(NONCE_SIZE)?;
    let cipher =
        Aes256Gcm::new_from_slice(aes_key.as_slice()).map_err(|_| CryptoError::EncryptFailed)?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: ephemeral_public.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::EncryptFailed)?;

    Ok(EncryptedEnvelope {
        ephemeral_public_key: ephemeral_public.as_bytes().to_vec(),
        nonce: nonce_bytes,
        ciphertext,
        sender_fingerprint: String::new(),
        signature: Vec::new(),
    })
}

/// Decrypt an envelope with the recipient's Ed25519 signing key.
///
/// # Errors
///
/// Returns [`CryptoError::DecryptFailed`] on any authentication-tag
/// mismatch, wrong key, or tampering; no partial plaintext is ever
/// returned. Malformed ephemeral keys yield [`CryptoError::InvalidKey`] or
/// [`CryptoError::RejectedPoint`].
pub fn decrypt(
    envelope: &EncryptedEnvelope,
    recipient_secret: &SigningKey,
) -> Result<Vec<u8>, CryptoError> {
    // 1. Parse and screen the ephemeral public key
    let ephemeral_bytes: [u8; POINT_SIZE] = envelope
        .ephemeral_public_key
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey {
            kind: "ephemeral public",
            reason: format!(
                "expected {} bytes, got {}",
                POINT_SIZE,
                envelope.ephemeral_public_key.len()
            ),
        })?;
    if is_small_order_point(&ephemeral_bytes) {
        return Err(CryptoError::RejectedPoint);
    }
    let ephemeral_public = X25519PublicKey::from(ephemeral_bytes);

    if envelope.nonce.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptFailed);
    }

    // 2. Recompute the shared secret from our converted signing key
    let x25519_secret = ed25519_secret_to_x25519(recipient_secret);
    let shared_secret = x25519_secret.diffie_hellman(&ephemeral_public);

    // 3. Re-derive the AEAD key; info needs our own X25519 public key
    let recipient_x25519 = ed25519_public_to_x25519(&recipient_secret.verifying_key())?;
    let aes_key = derive_key(
        shared_secret.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient_x25519.as_bytes(),
    )?;

    // 4. Open; any failure is a uniform DecryptFailed
    let cipher =
        Aes256Gcm::new_from_slice(aes_key.as_slice()).map_err(|_| CryptoError::DecryptFailed)?;
    cipher
        .decrypt(
            Nonce::from_slice(&envelope.nonce),
            Payload {
                msg: &envelope.ciphertext,
                aad: ephemeral_public.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Encrypt and sign in one step.
///
/// Performs [`encrypt`], then signs
/// `ephemeral_public_key || nonce || ciphertext` with the sender's Ed25519
/// key and attaches the signature and sender fingerprint.
pub fn encrypt_with_signature(
    plaintext: &[u8],
    recipient_public: &VerifyingKey,
    sender_secret: &SigningKey,
    sender_fingerprint: &str,
) -> Result<EncryptedEnvelope, CryptoError> {
    let mut envelope = encrypt(plaintext, recipient_public)?;
    envelope.sender_fingerprint = sender_fingerprint.to_string();

    let signature = sender_secret.sign(&envelope.signed_region());
    envelope.signature = signature.to_bytes().to_vec();

    Ok(envelope)
}

/// Verify the signature on an envelope against the claimed sender key.
///
/// # Errors
///
/// - [`CryptoError::Unsigned`] if the envelope carries no signature
/// - [`CryptoError::SignatureInvalid`] if the signature does not verify
pub fn verify_signature(
    envelope: &EncryptedEnvelope,
    sender_public: &VerifyingKey,
) -> Result<(), CryptoError> {
    if envelope.signature.is_empty() {
        return Err(CryptoError::Unsigned);
    }

    let sig_bytes: [u8; 64] = envelope
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::SignatureInvalid)?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    sender_public
        .verify(&envelope.signed_region(), &signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}
