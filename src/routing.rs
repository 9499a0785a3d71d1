// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Blind Routing Tokens
//!
//! The Hub routes commands to nodes by an opaque token instead of a node
//! identity. The token is a one-way derivation over a per-principal
//! secret, so the Hub can use it as a lookup key but cannot recover the
//! node ID or correlate tokens across principals.
//!
//! Stateless and purely functional; the secret never leaves the
//! controller/node process.

use base64::{engine::general_purpose::URL_SAFE, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::crypto::error::CryptoError;
use crate::crypto::wipe::{generate_random_bytes, secure_compare};

type HmacSha256 = Hmac<Sha256>;

/// Routing secret length in bytes.
pub const ROUTING_SECRET_SIZE: usize = 32;

/// Derive the routing token for a node:
/// `base64url(HMAC-SHA256(key = secret, msg = node_id))`.
///
/// Deterministic for a given `(node_id, secret)` pair and one-way: without
/// the secret the token reveals nothing about the node ID.
pub fn derive_routing_token(node_id: &str, secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(node_id.as_bytes());
    URL_SAFE.encode(mac.finalize().into_bytes())
}

/// Check a token against a `(node_id, secret)` pair in constant time.
pub fn verify_routing_token(node_id: &str, secret: &[u8], token: &str) -> bool {
    let expected = derive_routing_token(node_id, secret);
    secure_compare(expected.as_bytes(), token.as_bytes())
}

/// Generate a fresh 32-byte routing secret.
///
/// Created once per principal and stored by the caller; it is never sent
/// to the Hub.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the system RNG fails.
pub fn generate_routing_secret() -> Result<Vec<u8>, CryptoError> {
    generate_random_bytes(ROUTING_SECRET_SIZE)
}
