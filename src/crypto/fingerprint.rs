// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Key Fingerprints
//!
//! SHA-256 based fingerprints used to name principals without shipping
//! their full keys around.

use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};

/// SHA-256 of arbitrary data as a lowercase hex string.
pub fn hex_fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Fingerprint of an Ed25519 public key (SHA-256 of the raw key bytes).
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    hex_fingerprint(key.as_bytes())
}
