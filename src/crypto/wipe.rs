// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Sensitive-Buffer Hygiene
//!
//! Best-effort clearing of key material from memory. The allocator or the
//! compiler may have created copies we cannot reach, so this is defense in
//! depth rather than a guarantee.

use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::error::CryptoError;

/// Overwrite a buffer with random bytes and then zeros.
///
/// The random pass runs first so that a later zero-only snapshot of the
/// page does not reveal the original contents; if the RNG fails the zero
/// pass still runs.
pub fn wipe(buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    let _ = OsRng.try_fill_bytes(buf);
    buf.zeroize();
}

/// Fixed-size buffer that wipes itself on drop.
///
/// Used for derived AEAD keys and other short-lived secrets so every exit
/// path, including `?` early returns, clears the material.
pub(crate) struct SecretBytes<const N: usize>(pub(crate) [u8; N]);

impl<const N: usize> SecretBytes<N> {
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> Drop for SecretBytes<N> {
    fn drop(&mut self) {
        wipe(&mut self.0);
    }
}

/// Constant-time equality check for two byte slices.
///
/// Returns `false` for length mismatches without touching the contents.
pub fn secure_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Generate `n` cryptographically secure random bytes.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the system RNG fails; callers
/// must abort the surrounding operation rather than continue with weak
/// randomness.
pub fn generate_random_bytes(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; n];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|_| CryptoError::RandomFailed)?;
    Ok(buf)
}
