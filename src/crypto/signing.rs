// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Ed25519 Detached Signatures
//!
//! Thin wrappers over `ed25519-dalek` used by the peer handshake and the
//! envelope layer. Ed25519 is deterministic, so signing needs no nonce
//! management.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};

use crate::crypto::error::CryptoError;

/// Signature size in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Sign data with an Ed25519 key, returning the 64-byte signature.
pub fn sign(data: &[u8], key: &SigningKey) -> Vec<u8> {
    key.sign(data).to_bytes().to_vec()
}

/// Verify an Ed25519 signature.
///
/// # Errors
///
/// Returns [`CryptoError::SignatureInvalid`] if the signature is malformed
/// or does not verify against the key.
pub fn verify(data: &[u8], signature: &[u8], key: &VerifyingKey) -> Result<(), CryptoError> {
    let sig_bytes: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| CryptoError::SignatureInvalid)?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    key.verify(data, &signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}

/// Parse a 32-byte Ed25519 public key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] for wrong sizes or encodings that
/// are not a valid curve point.
pub fn parse_public_key(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
        kind: "public",
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidKey {
        kind: "public",
        reason: "not a valid curve point".to_string(),
    })
}
