// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Peer Certificate Verification
//!
//! The handshake can optionally pin peers to a trust root: each side
//! presents an Ed25519-signed leaf certificate, and the verifier checks
//! issuer signature, validity window, and that the certificate's subject
//! key matches the key the peer claims. Certificate issuance and rotation
//! are external; this module only verifies what a peer presents.

use ed25519_dalek::VerifyingKey;
use x509_parser::oid_registry::OID_SIG_ED25519;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::crypto;
use crate::crypto::wipe::secure_compare;
use crate::p2p::error::TransportError;

/// The trusted root key peers' certificates must chain to.
#[derive(Debug)]
pub struct TrustRoot {
    ca_key: VerifyingKey,
}

impl TrustRoot {
    /// Pin directly to a known CA public key.
    pub fn from_key(ca_key: VerifyingKey) -> Self {
        Self { ca_key }
    }

    /// Extract the CA key from a PEM-encoded root certificate.
    pub fn from_ca_cert_pem(pem: &[u8]) -> Result<Self, TransportError> {
        let (_, parsed) = parse_x509_pem(pem)
            .map_err(|e| TransportError::CertificateInvalid(format!("bad CA PEM: {e}")))?;
        let cert = parsed
            .parse_x509()
            .map_err(|e| TransportError::CertificateInvalid(format!("bad CA certificate: {e}")))?;

        let ca_key = spki_ed25519_key(cert.public_key())?;
        Ok(Self { ca_key })
    }

    /// The pinned CA public key.
    pub fn ca_key(&self) -> &VerifyingKey {
        &self.ca_key
    }

    /// Verify a peer's leaf certificate.
    ///
    /// Checks, in order: PEM/DER parse, Ed25519 signature algorithm,
    /// issuer signature by the trust root, validity window, and that the
    /// certificate's subject key equals `claimed_key` (constant-time).
    pub fn verify_peer(
        &self,
        cert_pem: &str,
        claimed_key: &VerifyingKey,
    ) -> Result<(), TransportError> {
        let (_, parsed) = parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| TransportError::CertificateInvalid(format!("bad PEM: {e}")))?;
        let cert = parsed
            .parse_x509()
            .map_err(|e| TransportError::CertificateInvalid(format!("bad certificate: {e}")))?;

        if cert.signature_algorithm.algorithm != OID_SIG_ED25519 {
            return Err(TransportError::CertificateInvalid(
                "certificate is not Ed25519-signed".to_string(),
            ));
        }

        // Issuer signature over the raw TBS bytes.
        crypto::verify(
            cert.tbs_certificate.as_ref(),
            cert.signature_value.data.as_ref(),
            &self.ca_key,
        )
        .map_err(|_| {
            TransportError::CertificateInvalid(
                "certificate not signed by trusted root".to_string(),
            )
        })?;

        if !cert.validity().is_valid() {
            return Err(TransportError::CertificateInvalid(
                "certificate expired or not yet valid".to_string(),
            ));
        }

        let cert_key = spki_ed25519_key(cert.public_key())?;
        if !secure_compare(cert_key.as_bytes(), claimed_key.as_bytes()) {
            return Err(TransportError::CertificateInvalid(
                "claimed key does not match certificate".to_string(),
            ));
        }

        Ok(())
    }
}

/// Extract an Ed25519 key from a SubjectPublicKeyInfo.
fn spki_ed25519_key(spki: &SubjectPublicKeyInfo<'_>) -> Result<VerifyingKey, TransportError> {
    if spki.algorithm.algorithm != OID_SIG_ED25519 {
        return Err(TransportError::CertificateInvalid(
            "certificate key is not Ed25519".to_string(),
        ));
    }
    crypto::parse_public_key(spki.subject_public_key.data.as_ref())
        .map_err(|_| TransportError::CertificateInvalid("malformed subject key".to_string()))
}

/// Parse an Ed25519 key out of a standalone PEM/DER SubjectPublicKeyInfo.
/// Convenience for applications that store the trust root as a bare key.
pub fn public_key_from_spki_der(der: &[u8]) -> Result<VerifyingKey, TransportError> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(der)
        .map_err(|e| TransportError::CertificateInvalid(format!("bad SPKI: {e}")))?;
    spki_ed25519_key(&spki)
}
