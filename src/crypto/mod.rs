// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! End-to-End Encryption Primitives
//!
//! This module implements the cryptographic core of the relay:
//!
//! - **Envelope**: hybrid X25519 + AES-256-GCM encryption with Ed25519
//!   signatures over the sealed bytes
//! - **Signing**: detached Ed25519 signatures for the peer handshake
//! - **Fingerprint**: SHA-256 key fingerprints naming principals
//! - **Wipe**: best-effort clearing of key material from memory
//!
//! ## Security Considerations
//!
//! - Ephemeral keys are single-use; a fresh keypair is generated per
//!   envelope and discarded after the shared secret is computed
//! - Ed25519→X25519 conversions reject small-order points to prevent
//!   key-confirmation and small-subgroup leakage
//! - The ephemeral public key rides along as AEAD additional data, binding
//!   each ciphertext to its key exchange
//! - Derived keys, shared secrets, and discarded hash halves are
//!   overwritten (random pass, then zeros) on every exit path

pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod signing;
pub mod wipe;

pub use envelope::{
    decrypt, ed25519_public_to_x25519, ed25519_secret_to_x25519, encrypt, encrypt_with_signature,
    verify_signature, EncryptedEnvelope,
};
pub use error::CryptoError;
pub use fingerprint::{hex_fingerprint, key_fingerprint};
pub use signing::{parse_public_key, sign, verify, SIGNATURE_SIZE};
pub use wipe::{generate_random_bytes, secure_compare, wipe};
