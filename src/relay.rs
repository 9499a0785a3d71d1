// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Hub-Facing Interfaces
//!
//! The Hub is a blind relay: it forwards opaque envelope bytes keyed by a
//! routing token and shuttles signaling frames between peers it cannot
//! decrypt. This module defines the narrow traits the core consumes; the
//! concrete gRPC/HTTP client, TLS setup, and bearer-token auth live in the
//! surrounding application.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::crypto::EncryptedEnvelope;

/// Kind of a signaling frame exchanged while bootstrapping a P2P session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// One signaling frame, relayed by the Hub by peer ID. The payload is an
/// opaque blob owned by the underlying data-channel implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalFrame {
    /// Peer the frame is addressed to.
    pub target_id: String,
    /// Peer the frame came from (stamped by the Hub).
    #[serde(default)]
    pub source_id: String,
    /// Frame kind.
    pub kind: SignalKind,
    /// Opaque offer/answer/candidate payload.
    pub payload: Vec<u8>,
}

/// A live bidirectional signaling stream obtained from the Hub.
pub struct SignalingSession {
    /// Frames to send towards the Hub.
    pub outbound: mpsc::Sender<SignalFrame>,
    /// Frames arriving from the Hub.
    pub inbound: mpsc::Receiver<SignalFrame>,
}

/// The Hub's byte-forwarding service, as seen from this core.
///
/// Implementations must treat the envelope as opaque: the Hub never holds
/// keys that could open it, and both request and response travel through
/// unmodified.
#[async_trait]
pub trait HubRelay: Send + Sync {
    /// Forward an encrypted command to the node addressed by
    /// `routing_token` and return the node's encrypted reply.
    async fn send_encrypted_command(
        &self,
        node_id: &str,
        envelope: EncryptedEnvelope,
        routing_token: &str,
    ) -> anyhow::Result<EncryptedEnvelope>;

    /// Open the signaling stream used to bootstrap P2P sessions.
    async fn open_signaling(&self) -> anyhow::Result<SignalingSession>;
}

/// A direct (LAN / localhost) control channel to a single node, bypassing
/// both Hub and P2P. Authentication is a bearer token managed by the
/// caller; the payload is the same encrypted envelope as everywhere else.
#[async_trait]
pub trait DirectChannel: Send + Sync {
    /// Send an encrypted command over the direct channel and return the
    /// node's encrypted reply.
    async fn send_encrypted(
        &self,
        envelope: EncryptedEnvelope,
        bearer_token: &str,
    ) -> anyhow::Result<EncryptedEnvelope>;
}
