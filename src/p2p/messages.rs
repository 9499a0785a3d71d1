// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! P2P Wire Messages
//!
//! Two message families travel over a data channel:
//!
//! - [`AuthMessage`]: the pre-authentication challenge–response handshake.
//!   These are the only plaintext frames a session ever carries.
//! - [`P2pMessage`]: everything after authentication, always wrapped in an
//!   encrypted envelope addressed to the peer's verified key. The inner
//!   message carries its own nonce and timestamp for replay rejection.

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::crypto::EncryptedEnvelope;
use crate::dispatch::types::CommandType;
use crate::p2p::error::TransportError;
use ed25519_dalek::{SigningKey, VerifyingKey};

/// Handshake messages. Exchanged in plaintext before the session is
/// trusted; nothing else is accepted from an unauthenticated peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMessage {
    /// A fresh random nonce for the peer to sign, together with the
    /// sender's claimed identity.
    Challenge {
        nonce: Vec<u8>,
        claimed_id: String,
        public_key: Vec<u8>,
        #[serde(default)]
        cert_pem: String,
    },
    /// Signature over the challenged nonce, echoing it back so the
    /// verifier can bind response to challenge.
    Response {
        claimed_id: String,
        public_key: Vec<u8>,
        #[serde(default)]
        cert_pem: String,
        signature: Vec<u8>,
        echoed_nonce: Vec<u8>,
    },
    /// Verifier confirms the peer's response checked out.
    Success,
    /// Verification failed; the connection is about to close.
    Failed,
}

impl AuthMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Message kinds carried after authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ApprovalRequest,
    ApprovalDecision,
    Metrics,
    Command,
    CommandResponse,
    /// Outer wrapper around an encrypted inner message.
    Encrypted,
}

/// Envelope for all post-authentication P2P traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pMessage {
    pub kind: MessageKind,
    /// Unix seconds at send time; bounds the replay window.
    pub timestamp: i64,
    /// Random unique ID for replay rejection (empty only on the outer
    /// encrypted wrapper, whose inner message carries the real nonce).
    #[serde(default)]
    pub nonce: String,
    /// Correlates a command with its response.
    #[serde(default)]
    pub request_id: String,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl P2pMessage {
    /// Build a message with a fresh nonce and current timestamp.
    pub fn new<T: Serialize>(kind: MessageKind, payload: &T) -> Result<Self, TransportError> {
        Ok(Self {
            kind,
            timestamp: chrono::Utc::now().timestamp(),
            nonce: hex::encode(crypto::generate_random_bytes(16)?),
            request_id: String::new(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Like [`P2pMessage::new`] but tagged with a request ID for
    /// request/response correlation.
    pub fn with_request_id<T: Serialize>(
        kind: MessageKind,
        request_id: String,
        payload: &T,
    ) -> Result<Self, TransportError> {
        let mut msg = Self::new(kind, payload)?;
        msg.request_id = request_id;
        Ok(msg)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn parse_approval_request(&self) -> Result<ApprovalRequest, TransportError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn parse_approval_decision(&self) -> Result<ApprovalDecision, TransportError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn parse_command(&self) -> Result<CommandPayload, TransportError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn parse_command_response(&self) -> Result<CommandResponse, TransportError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Sent from node to controller when a proxied connection needs a human
/// decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub node_id: String,
    pub proxy_id: String,
    pub source_ip: String,
    pub dest_addr: String,
    #[serde(default)]
    pub rule_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub geo_country: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub geo_city: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub geo_isp: String,
    #[serde(default)]
    pub severity: String,
}

/// What to do with the connection that triggered an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Allow,
    Block,
    BlockAndAddRule,
}

/// Controller's reply to an [`ApprovalRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub request_id: String,
    pub action: ApprovalAction,
    /// How long the node caches this decision, in seconds.
    #[serde(default)]
    pub duration_seconds: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// A command sent over P2P. `data` is the marshalled anti-replay
/// `SecureCommandPayload`, same as on the Hub path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command_type: CommandType,
    pub data: Vec<u8>,
}

/// The node's reply to a P2P command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub request_id: String,
    pub status: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Encrypt a P2P message to the recipient's Ed25519 key and wrap it in an
/// outer `Encrypted` message ready for the wire.
pub fn encrypt_message(
    msg: &P2pMessage,
    recipient: &VerifyingKey,
) -> Result<Vec<u8>, TransportError> {
    let inner = msg.to_bytes()?;
    let envelope = crypto::encrypt(&inner, recipient)?;

    let wrapper = P2pMessage {
        kind: MessageKind::Encrypted,
        timestamp: chrono::Utc::now().timestamp(),
        nonce: String::new(),
        request_id: String::new(),
        payload: serde_json::to_value(&envelope)?,
    };
    wrapper.to_bytes()
}

/// Unwrap and decrypt an inbound frame.
///
/// # Errors
///
/// Returns [`TransportError::Unencrypted`] if the frame is not an
/// encrypted wrapper (there is no plaintext fallback after
/// authentication) and [`CryptoError::DecryptFailed`] (wrapped) if the
/// envelope does not open with our key.
///
/// [`CryptoError::DecryptFailed`]: crate::crypto::CryptoError::DecryptFailed
pub fn decrypt_message(data: &[u8], secret: &SigningKey) -> Result<P2pMessage, TransportError> {
    let wrapper = P2pMessage::from_bytes(data)?;
    if wrapper.kind != MessageKind::Encrypted {
        return Err(TransportError::Unencrypted);
    }

    let envelope: EncryptedEnvelope = serde_json::from_value(wrapper.payload)?;
    let plaintext = crypto::decrypt(&envelope, secret)?;
    P2pMessage::from_bytes(&plaintext)
}
