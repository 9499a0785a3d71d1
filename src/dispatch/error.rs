// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Command Dispatch Error Types
//!
//! Callers get a typed error naming the failing stage (route selection,
//! encryption, transport, verification) without key material or
//! plaintext in the messages. Cryptographic and zero-trust failures are
//! never downgraded to warnings.

use std::time::Duration;

use thiserror::Error;

use crate::crypto::error::CryptoError;
use crate::p2p::error::TransportError;

/// Errors from the command dispatch pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No local signing identity is loaded.
    #[error("identity not available")]
    IdentityUnavailable,

    /// No usable transport exists for the node.
    #[error("no route to node {0}")]
    NoRoute(String),

    /// P2P was required but the session is not authenticated.
    #[error("peer session not authenticated for node {0}")]
    PeerUnauthenticated(String),

    /// The node's public key is not registered; end-to-end encryption is
    /// impossible without it.
    #[error("no public key registered for node {0}")]
    MissingNodeKey(String),

    /// Building the encrypted command envelope failed.
    #[error("command encryption failed: {0}")]
    Encryption(#[source] CryptoError),

    /// The response envelope carried no signature. An unsigned response is
    /// a protocol violation under the zero-trust model, not a warning.
    #[error("response from node {0} is not signed")]
    ResponseUnsigned(String),

    /// The response signature did not verify against the node's key.
    #[error("response signature verification failed")]
    SignatureInvalid(#[source] CryptoError),

    /// The response envelope did not decrypt.
    #[error("response decryption failed")]
    DecryptFailed(#[source] CryptoError),

    /// An inbound command failed replay validation (node side).
    #[error("replay rejected: {0}")]
    Replay(String),

    /// The command round trip exceeded its deadline.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The node processed the command and reported an error.
    #[error("node returned error: {0}")]
    Remote(String),

    /// The Hub relay call failed. Terminal for the dispatch attempt.
    #[error("hub relay error: {0}")]
    Hub(anyhow::Error),

    /// The direct channel call failed.
    #[error("direct channel error: {0}")]
    Direct(anyhow::Error),

    /// The P2P transport failed (retryable via Hub fallback unless the
    /// mode pins P2P).
    #[error("p2p transport error: {0}")]
    Transport(#[source] TransportError),

    /// Inbound crypto failure while unwrapping a command (node side).
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// A wire structure failed to parse.
    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}
