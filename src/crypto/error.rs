// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Crypto Error Types
//!
//! Typed failures for the envelope crypto layer. Messages deliberately
//! carry no key material or plaintext fragments; callers learn the failing
//! stage, nothing more.

use thiserror::Error;

/// Errors produced by envelope encryption, signing, and key conversion.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A key had the wrong size or did not parse as a curve point.
    #[error("invalid {kind} key: {reason}")]
    InvalidKey {
        /// Which key failed (e.g. "recipient public", "ephemeral public").
        kind: &'static str,
        /// Specific failure reason.
        reason: String,
    },

    /// The Ed25519→X25519 conversion produced a point in the small-order
    /// subgroup. Using it would leak information about the private key, so
    /// the operation is aborted.
    #[error("rejected small-order curve point")]
    RejectedPoint,

    /// AEAD sealing failed.
    #[error("encryption failed")]
    EncryptFailed,

    /// AEAD opening failed: authentication tag mismatch, wrong key, or
    /// tampered ciphertext/nonce/AAD. No partial plaintext is returned.
    #[error("decryption failed")]
    DecryptFailed,

    /// The envelope carries no signature but one was required.
    #[error("payload is not signed")]
    Unsigned,

    /// The envelope signature did not verify against the claimed key.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The system RNG failed. The affected operation must abort instead of
    /// proceeding with weak randomness.
    #[error("system random number generator failure")]
    RandomFailed,
}
