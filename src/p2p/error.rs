// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! P2P Transport Error Types

use std::time::Duration;

use thiserror::Error;

use crate::crypto::error::CryptoError;

/// Errors produced by the authenticated P2P transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying data channel is closed.
    #[error("data channel closed")]
    ChannelClosed,

    /// Sending over the data channel failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// No session exists for the requested peer.
    #[error("no connection to peer {0}")]
    NotConnected(String),

    /// A session exists but has not completed the handshake.
    #[error("peer {0} is not authenticated")]
    PeerUnauthenticated(String),

    /// The challenge–response handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// An inbound message reused a nonce or fell outside the acceptance
    /// window.
    #[error("replay detected")]
    ReplayDetected,

    /// An inbound frame was not an encrypted message. There is no
    /// plaintext fallback after authentication.
    #[error("unencrypted message rejected")]
    Unencrypted,

    /// Request/response correlation requires a request ID.
    #[error("message has no request id")]
    MissingRequestId,

    /// No response arrived within the deadline.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// Signaling stream failure.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Peer certificate did not verify against the trust root.
    #[error("certificate verification failed: {0}")]
    CertificateInvalid(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}
