// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Command Dispatcher
//!
//! The controller-side pipeline for sending an end-to-end encrypted
//! command to a node. Transport selection, in priority order:
//!
//! 1. **Direct connection**: a registered direct channel bypasses Hub
//!    and P2P entirely
//! 2. **P2P**: used when the mode allows it and an authenticated peer
//!    session exists; failures fall back to the Hub unless the mode pins
//!    P2P
//! 3. **Hub relay**: opaque forwarding addressed by a blind routing
//!    token
//!
//! Every transport carries the same construction: the inner command is
//! wrapped in an anti-replay payload, encrypted to the node's key, and
//! signed with the local identity. On the reply path an unsigned envelope
//! is rejected outright, the node's signature is verified, and only then
//! is the result decrypted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use ed25519_dalek::VerifyingKey;

use crate::config::{Config, P2pMode};
use crate::crypto;
use crate::crypto::EncryptedEnvelope;
use crate::dispatch::error::DispatchError;
use crate::dispatch::types::{
    new_request_id, CommandResult, CommandType, InnerCommand, SecureCommandPayload,
};
use crate::identity::Identity;
use crate::p2p::messages::{CommandPayload, MessageKind, P2pMessage};
use crate::p2p::Transport;
use crate::relay::{DirectChannel, HubRelay};
use crate::routing::derive_routing_token;

/// A registered direct (LAN / localhost) connection to one node.
#[derive(Clone)]
pub struct DirectConnection {
    pub channel: Arc<dyn DirectChannel>,
    /// Bearer token presented to the direct channel.
    pub bearer_token: String,
    /// The node's signing key, required for end-to-end encryption.
    pub node_public_key: VerifyingKey,
}

struct DispatcherState {
    identity: RwLock<Option<Arc<Identity>>>,
    p2p_mode: RwLock<P2pMode>,
    default_timeout: Duration,
    node_keys: RwLock<HashMap<String, VerifyingKey>>,
    direct: RwLock<HashMap<String, DirectConnection>>,
    hub: RwLock<Option<Arc<dyn HubRelay>>>,
    transport: RwLock<Option<Transport>>,
    routing_secret: RwLock<Option<Vec<u8>>>,
}

/// Controller-side command dispatch with transport fallback.
#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<DispatcherState>,
}

impl Dispatcher {
    pub fn new(config: &Config) -> Self {
        Self {
            state: Arc::new(DispatcherState {
                identity: RwLock::new(None),
                p2p_mode: RwLock::new(config.p2p_mode),
                default_timeout: config.command_timeout,
                node_keys: RwLock::new(HashMap::new()),
                direct: RwLock::new(HashMap::new()),
                hub: RwLock::new(None),
                transport: RwLock::new(None),
                routing_secret: RwLock::new(None),
            }),
        }
    }

    /// Load the signing identity used to encrypt and sign commands.
    pub async fn set_identity(&self, identity: Arc<Identity>) {
        *self.state.identity.write().await = Some(identity);
    }

    /// Change the transport selection policy at runtime.
    pub async fn set_p2p_mode(&self, mode: P2pMode) {
        *self.state.p2p_mode.write().await = mode;
    }

    /// Attach the Hub relay client.
    pub async fn set_hub(&self, hub: Arc<dyn HubRelay>) {
        *self.state.hub.write().await = Some(hub);
    }

    /// Attach the P2P transport.
    pub async fn set_transport(&self, transport: Transport) {
        *self.state.transport.write().await = Some(transport);
    }

    /// Set the secret used to derive blind routing tokens.
    pub async fn set_routing_secret(&self, secret: Vec<u8>) {
        *self.state.routing_secret.write().await = Some(secret);
    }

    /// Cache a node's public key for end-to-end encryption.
    pub async fn register_node_key(&self, node_id: &str, key: VerifyingKey) {
        self.state
            .node_keys
            .write()
            .await
            .insert(node_id.to_string(), key);
    }

    /// The cached public key for a node.
    pub async fn node_key(&self, node_id: &str) -> Option<VerifyingKey> {
        self.state.node_keys.read().await.get(node_id).copied()
    }

    /// Register a direct connection; it takes priority over every other
    /// transport for this node.
    pub async fn set_direct_connection(&self, node_id: &str, connection: DirectConnection) {
        self.state
            .node_keys
            .write()
            .await
            .insert(node_id.to_string(), connection.node_public_key);
        self.state
            .direct
            .write()
            .await
            .insert(node_id.to_string(), connection);
    }

    /// Remove a direct connection.
    pub async fn remove_direct_connection(&self, node_id: &str) {
        self.state.direct.write().await.remove(node_id);
    }

    /// Derive the routing token for a node, if a routing secret is set.
    pub async fn routing_token(&self, node_id: &str) -> Option<String> {
        let secret = self.state.routing_secret.read().await;
        secret
            .as_deref()
            .map(|secret| derive_routing_token(node_id, secret))
    }

    /// Send an end-to-end encrypted command to a node.
    ///
    /// Blocks the caller until the node's verified response arrives or the
    /// deadline (default 25 s) passes.
    pub async fn send_command(
        &self,
        node_id: &str,
        command_type: CommandType,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, DispatchError> {
        let timeout = timeout.unwrap_or(self.state.default_timeout);

        let identity = self
            .state
            .identity
            .read()
            .await
            .clone()
            .ok_or(DispatchError::IdentityUnavailable)?;

        // 0. A direct connection takes priority over everything.
        let direct = self.state.direct.read().await.get(node_id).cloned();
        if let Some(direct) = direct {
            return self
                .send_via_direct(&identity, &direct, command_type, payload, timeout)
                .await;
        }

        let mode = *self.state.p2p_mode.read().await;
        let transport = self.state.transport.read().await.clone();

        // 1. P2P, when the mode allows it and the session is usable.
        if mode != P2pMode::HubOnly {
            let mut session = None;
            if let Some(t) = &transport {
                if t.is_connected(node_id).await && t.is_authenticated(node_id).await {
                    session = Some(t);
                }
            }
            match session {
                Some(t) => {
                    match self
                        .send_via_p2p(t, node_id, command_type, payload.clone(), timeout)
                        .await
                    {
                        Ok(result) => return Ok(result),
                        Err(e) if mode == P2pMode::DirectOnly => return Err(e),
                        Err(e) => {
                            debug!(node = %node_id, error = %e, "p2p send failed, falling back to hub");
                        }
                    }
                }
                // Direct-only with no authenticated session: no fallback.
                None if mode == P2pMode::DirectOnly => {
                    return Err(DispatchError::NoRoute(node_id.to_string()));
                }
                None => {}
            }
        }

        // 2. Hub relay.
        self.send_via_hub(&identity, node_id, command_type, payload, timeout)
            .await
    }

    /// Like [`send_command`](Self::send_command), but treats a non-OK
    /// status as an error and returns the response payload directly.
    pub async fn send_command_ok(
        &self,
        node_id: &str,
        command_type: CommandType,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, DispatchError> {
        let result = self
            .send_command(node_id, command_type, payload, timeout)
            .await?;
        if !result.is_ok() {
            return Err(DispatchError::Remote(result.error_message));
        }
        Ok(result.response_payload)
    }

    /// Marshal and seal one command: inner → anti-replay wrapper →
    /// encrypted + signed envelope.
    fn seal_command(
        identity: &Identity,
        node_key: &VerifyingKey,
        command_type: CommandType,
        payload: Vec<u8>,
    ) -> Result<EncryptedEnvelope, DispatchError> {
        let secure_bytes = Self::secure_payload_bytes(command_type, payload)?;
        crypto::encrypt_with_signature(
            &secure_bytes,
            node_key,
            identity.signing_key(),
            identity.fingerprint(),
        )
        .map_err(DispatchError::Encryption)
    }

    /// Marshal the anti-replay wrapper, returning its bytes and the fresh
    /// request ID.
    fn secure_payload_bytes_with_id(
        command_type: CommandType,
        payload: Vec<u8>,
    ) -> Result<(Vec<u8>, String), DispatchError> {
        let inner = InnerCommand {
            command_type,
            payload,
        };
        let request_id = new_request_id()?;
        let secure =
            SecureCommandPayload::new(request_id.clone(), serde_json::to_vec(&inner)?);
        Ok((serde_json::to_vec(&secure)?, request_id))
    }

    fn secure_payload_bytes(
        command_type: CommandType,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, DispatchError> {
        Self::secure_payload_bytes_with_id(command_type, payload).map(|(bytes, _)| bytes)
    }

    /// Verify and open a reply envelope. Rejecting unsigned responses here
    /// is the zero-trust invariant: the Hub could substitute bytes, a
    /// signature by the node is the only thing that makes them a response.
    fn unwrap_reply(
        identity: &Identity,
        node_id: &str,
        node_key: &VerifyingKey,
        reply: &EncryptedEnvelope,
    ) -> Result<CommandResult, DispatchError> {
        if !reply.is_signed() {
            return Err(DispatchError::ResponseUnsigned(node_id.to_string()));
        }
        crypto::verify_signature(reply, node_key).map_err(DispatchError::SignatureInvalid)?;

        let result_bytes =
            crypto::decrypt(reply, identity.signing_key()).map_err(DispatchError::DecryptFailed)?;
        Ok(serde_json::from_slice(&result_bytes)?)
    }

    async fn send_via_direct(
        &self,
        identity: &Identity,
        direct: &DirectConnection,
        command_type: CommandType,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<CommandResult, DispatchError> {
        debug!(command = ?command_type, "sending command via direct connection");
        let envelope =
            Self::seal_command(identity, &direct.node_public_key, command_type, payload)?;

        let reply = tokio::time::timeout(
            timeout,
            direct.channel.send_encrypted(envelope, &direct.bearer_token),
        )
        .await
        .map_err(|_| DispatchError::Timeout(timeout))?
        .map_err(DispatchError::Direct)?;

        Self::unwrap_reply(identity, "direct", &direct.node_public_key, &reply)
    }

    async fn send_via_p2p(
        &self,
        transport: &Transport,
        node_id: &str,
        command_type: CommandType,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<CommandResult, DispatchError> {
        debug!(node = %node_id, command = ?command_type, "sending command via p2p");
        let (secure_bytes, request_id) =
            Self::secure_payload_bytes_with_id(command_type, payload)?;

        let command = CommandPayload {
            command_type,
            data: secure_bytes,
        };
        let msg = P2pMessage::with_request_id(MessageKind::Command, request_id, &command)
            .map_err(DispatchError::Transport)?;

        let response = transport
            .send_command_and_wait(node_id, msg, Some(timeout))
            .await
            .map_err(DispatchError::Transport)?;

        let response = response
            .parse_command_response()
            .map_err(DispatchError::Transport)?;
        Ok(CommandResult {
            status: response.status,
            error_message: response.error,
            response_payload: response.data,
        })
    }

    async fn send_via_hub(
        &self,
        identity: &Identity,
        node_id: &str,
        command_type: CommandType,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<CommandResult, DispatchError> {
        let hub = self
            .state
            .hub
            .read()
            .await
            .clone()
            .ok_or_else(|| DispatchError::NoRoute(node_id.to_string()))?;
        let node_key = self
            .node_key(node_id)
            .await
            .ok_or_else(|| DispatchError::MissingNodeKey(node_id.to_string()))?;

        let routing_token = self.routing_token(node_id).await.unwrap_or_default();
        if routing_token.is_empty() {
            warn!(node = %node_id, "no routing secret set, sending without routing token");
        }

        debug!(node = %node_id, command = ?command_type, "sending command via hub relay");
        let envelope = Self::seal_command(identity, &node_key, command_type, payload)?;

        let reply = tokio::time::timeout(
            timeout,
            hub.send_encrypted_command(node_id, envelope, &routing_token),
        )
        .await
        .map_err(|_| DispatchError::Timeout(timeout))?
        .map_err(DispatchError::Hub)?;

        Self::unwrap_reply(identity, node_id, &node_key, &reply)
    }
}
