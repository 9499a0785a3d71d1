// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Principal Identity
//!
//! A principal (controller or node) is identified by a long-lived Ed25519
//! signing keypair. Key storage, passphrase protection, and certificate
//! issuance belong to the surrounding application; this wrapper only holds
//! the loaded key, its fingerprint, and an optional leaf certificate used
//! during the peer handshake.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};

use crate::crypto::error::CryptoError;
use crate::crypto::fingerprint::key_fingerprint;
use crate::crypto::wipe::wipe;

/// A loaded signing identity. The private key never leaves this process.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    fingerprint: String,
    cert_pem: Option<Vec<u8>>,
}

impl Identity {
    /// Wrap an externally supplied signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let fingerprint = key_fingerprint(&signing_key.verifying_key());
        Self {
            signing_key,
            fingerprint,
            cert_pem: None,
        }
    }

    /// Build an identity from a raw 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// Generate a fresh identity.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the system RNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|_| CryptoError::RandomFailed)?;
        let identity = Self::from_seed(&seed);
        wipe(&mut seed);
        Ok(identity)
    }

    /// Attach the leaf certificate (PEM) presented during the handshake.
    pub fn with_cert_pem(mut self, cert_pem: Vec<u8>) -> Self {
        self.cert_pem = Some(cert_pem);
        self
    }

    /// The signing key.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// The public half of the identity key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Hex SHA-256 fingerprint of the public key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The leaf certificate, if one was attached.
    pub fn cert_pem(&self) -> Option<&[u8]> {
        self.cert_pem.as_deref()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug output.
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .field("has_cert", &self.cert_pem.is_some())
            .finish()
    }
}
