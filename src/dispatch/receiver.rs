// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Node-Side Command Receiver
//!
//! The receiving end of the dispatch pipeline. Whatever transport a
//! command arrived by (Hub relay, P2P, or a direct channel), the node
//! unwraps it the same way:
//!
//! 1. reject unsigned envelopes, verify the controller's signature
//! 2. decrypt with the node identity
//! 3. validate the anti-replay wrapper (request ID + timestamp +
//!    fingerprint) against the [`ReplayGuard`]
//! 4. run the registered handler on the inner command
//! 5. encrypt and sign the [`CommandResult`] back to the sender
//!
//! Crypto failures never produce a reply envelope; a caller that cannot
//! authenticate gets nothing to chew on.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use ed25519_dalek::VerifyingKey;

use crate::crypto;
use crate::crypto::EncryptedEnvelope;
use crate::dispatch::error::DispatchError;
use crate::dispatch::replay::ReplayGuard;
use crate::dispatch::types::{CommandResult, InnerCommand, SecureCommandPayload};
use crate::identity::Identity;

/// Async handler turning an [`InnerCommand`] into a [`CommandResult`].
pub type CommandHandlerFn =
    Arc<dyn Fn(InnerCommand) -> BoxFuture<'static, CommandResult> + Send + Sync>;

/// Unwraps inbound command envelopes and produces signed reply envelopes.
pub struct CommandReceiver {
    identity: Arc<Identity>,
    replay_guard: ReplayGuard,
    handler: CommandHandlerFn,
}

impl CommandReceiver {
    /// Create a receiver.
    ///
    /// Must be called within a Tokio runtime (the replay guard starts its
    /// sweeper).
    pub fn new(identity: Arc<Identity>, replay_guard: ReplayGuard, handler: CommandHandlerFn) -> Self {
        Self {
            identity,
            replay_guard,
            handler,
        }
    }

    /// Process one command envelope from `sender_public` and return the
    /// encrypted, signed reply envelope.
    ///
    /// # Errors
    ///
    /// Unsigned or unverifiable envelopes, undecryptable payloads, and
    /// replayed request IDs all fail before the handler runs.
    pub async fn handle_envelope(
        &self,
        envelope: &EncryptedEnvelope,
        sender_public: &VerifyingKey,
    ) -> Result<EncryptedEnvelope, DispatchError> {
        // 1. Zero-trust: unsigned commands are protocol violations.
        crypto::verify_signature(envelope, sender_public)?;

        // 2. Decrypt with the node identity.
        let secure_bytes = crypto::decrypt(envelope, self.identity.signing_key())?;
        let secure: SecureCommandPayload = serde_json::from_slice(&secure_bytes)?;

        // 3. Anti-replay validation before anything executes.
        self.replay_guard.validate(
            &secure.request_id,
            secure.timestamp,
            &envelope.sender_fingerprint,
        )?;

        // 4. Run the command.
        let inner: InnerCommand = serde_json::from_slice(&secure.data)?;
        debug!(
            request_id = %secure.request_id,
            command = ?inner.command_type,
            "handling command"
        );
        let result = (self.handler)(inner).await;
        if !result.is_ok() {
            warn!(
                request_id = %secure.request_id,
                error = %result.error_message,
                "command handler reported error"
            );
        }

        // 5. Reply, encrypted to the sender and signed by us.
        let result_bytes = serde_json::to_vec(&result)?;
        crypto::encrypt_with_signature(
            &result_bytes,
            sender_public,
            self.identity.signing_key(),
            self.identity.fingerprint(),
        )
        .map_err(DispatchError::Encryption)
    }

    /// The node identity's public key, for callers that need to register
    /// it with a controller.
    pub fn public_key(&self) -> VerifyingKey {
        self.identity.verifying_key()
    }
}
