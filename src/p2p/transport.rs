// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Authenticated Peer Transport
//!
//! Manages one authenticated, encrypted session per remote peer on top of
//! driver-provided data channels, bootstrapped through Hub-relayed
//! signaling.
//!
//! ## Handshake
//!
//! When a channel opens, each side sends an `AuthChallenge` carrying a
//! fresh 32-byte nonce and its claimed identity. A peer answers with an
//! `AuthResponse` signing the nonce (and then issues its own challenge, so
//! authentication runs in both directions). Only a verified signature over
//! a nonce we generated ourselves moves the session to `Authenticated`;
//! any mismatch sends `AuthFailed` and closes the connection. No
//! application message is processed before that point.
//!
//! ## After authentication
//!
//! Every frame must decrypt as an encrypted message addressed to our key
//! (there is no plaintext fallback) and must pass the nonce ledger before
//! it is dispatched. Command responses are correlated to waiting callers
//! by request ID; approval requests and unrecognized messages go to
//! registered handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ed25519_dalek::VerifyingKey;

use crate::config::Config;
use crate::crypto;
use crate::identity::Identity;
use crate::p2p::cert::TrustRoot;
use crate::p2p::channel::{ChannelDriver, ChannelEvent, ChannelHandle, DataChannel};
use crate::p2p::error::TransportError;
use crate::p2p::messages::{
    decrypt_message, encrypt_message, ApprovalDecision, ApprovalRequest, AuthMessage,
    CommandPayload, CommandResponse, MessageKind, P2pMessage,
};
use crate::p2p::nonce::NonceLedger;
use crate::relay::{SignalFrame, SignalKind, SignalingSession};

/// Grace period for an `AuthFailed` message to flush before the channel
/// closes underneath it.
const AUTH_FAIL_SEND_DELAY: Duration = Duration::from_millis(100);

/// Challenge nonce size in bytes.
const CHALLENGE_SIZE: usize = 32;

/// Handshake progress of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Init,
    ChallengeSent,
    ChallengeReceived,
    Authenticated,
    Failed,
}

struct AuthState {
    stage: SessionStage,
    /// Nonce we challenged the peer with, awaiting their signature.
    challenge: Option<Vec<u8>>,
    /// Peer identity confirmed by a verified signature.
    verified_id: String,
}

struct Peer {
    remote_id: String,
    channel: Arc<dyn DataChannel>,
    auth: Mutex<AuthState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

type PeerStatusHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;
type ApprovalRequestHandler = Arc<dyn Fn(&str, ApprovalRequest) + Send + Sync>;
type ApprovalDecisionHandler = Arc<dyn Fn(&str, ApprovalDecision) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(&str, Vec<u8>) + Send + Sync>;
type CommandHandler =
    Arc<dyn Fn(String, CommandPayload, String) -> BoxFuture<'static, CommandResponse> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    peer_status: Option<PeerStatusHandler>,
    approval_request: Option<ApprovalRequestHandler>,
    approval_decision: Option<ApprovalDecisionHandler>,
    message: Option<MessageHandler>,
    command: Option<CommandHandler>,
}

struct Inner {
    local_id: String,
    identity: Arc<Identity>,
    driver: Arc<dyn ChannelDriver>,
    trust_root: std::sync::RwLock<Option<Arc<TrustRoot>>>,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    peer_keys: RwLock<HashMap<String, VerifyingKey>>,
    pending: Mutex<HashMap<String, oneshot::Sender<P2pMessage>>>,
    nonces: NonceLedger,
    handlers: std::sync::RwLock<Handlers>,
    signaling_tx: Mutex<Option<mpsc::Sender<SignalFrame>>>,
    signaling_task: Mutex<Option<JoinHandle<()>>>,
    offer_permits: Arc<Semaphore>,
    default_timeout: Duration,
}

/// Authenticated P2P transport for one local principal.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Create a transport.
    ///
    /// `local_id` is the identity announced to peers during the handshake
    /// (typically the identity fingerprint). Must be called within a Tokio
    /// runtime; the nonce ledger starts its sweeper immediately.
    pub fn new(
        local_id: impl Into<String>,
        identity: Arc<Identity>,
        driver: Arc<dyn ChannelDriver>,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_id: local_id.into(),
                identity,
                driver,
                trust_root: std::sync::RwLock::new(None),
                peers: RwLock::new(HashMap::new()),
                peer_keys: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                nonces: NonceLedger::new(config.nonce_window, config.max_nonce_entries),
                handlers: std::sync::RwLock::new(Handlers::default()),
                signaling_tx: Mutex::new(None),
                signaling_task: Mutex::new(None),
                offer_permits: Arc::new(Semaphore::new(config.max_concurrent_handshakes)),
                default_timeout: config.command_timeout,
            }),
        }
    }

    /// Require peer certificates to chain to this trust root.
    pub fn set_trust_root(&self, root: TrustRoot) {
        *self.inner.trust_root.write().expect("trust root poisoned") = Some(Arc::new(root));
    }

    /// Callback for peer connectivity transitions (at most one call per
    /// transition).
    pub fn set_peer_status_handler(&self, handler: impl Fn(&str, bool) + Send + Sync + 'static) {
        self.handlers_mut().peer_status = Some(Arc::new(handler));
    }

    /// Callback for inbound approval requests.
    pub fn set_approval_request_handler(
        &self,
        handler: impl Fn(&str, ApprovalRequest) + Send + Sync + 'static,
    ) {
        self.handlers_mut().approval_request = Some(Arc::new(handler));
    }

    /// Callback for inbound approval decisions (node side).
    pub fn set_approval_decision_handler(
        &self,
        handler: impl Fn(&str, ApprovalDecision) + Send + Sync + 'static,
    ) {
        self.handlers_mut().approval_decision = Some(Arc::new(handler));
    }

    /// Callback for messages no other handler claimed.
    pub fn set_message_handler(&self, handler: impl Fn(&str, Vec<u8>) + Send + Sync + 'static) {
        self.handlers_mut().message = Some(Arc::new(handler));
    }

    /// Async handler producing the response for inbound commands (node
    /// side).
    pub fn set_command_handler(
        &self,
        handler: impl Fn(String, CommandPayload, String) -> BoxFuture<'static, CommandResponse>
            + Send
            + Sync
            + 'static,
    ) {
        self.handlers_mut().command = Some(Arc::new(handler));
    }

    fn handlers_mut(&self) -> std::sync::RwLockWriteGuard<'_, Handlers> {
        self.inner.handlers.write().expect("handlers poisoned")
    }

    /// Pin a peer's public key ahead of time (e.g. from pairing state).
    pub async fn register_peer_key(&self, peer_id: &str, key: VerifyingKey) {
        self.inner
            .peer_keys
            .write()
            .await
            .insert(peer_id.to_string(), key);
    }

    /// The peer's verified (or pre-registered) public key.
    pub async fn peer_key(&self, peer_id: &str) -> Option<VerifyingKey> {
        self.inner.peer_keys.read().await.get(peer_id).copied()
    }

    /// Attach the Hub signaling stream and start demultiplexing frames.
    pub async fn start(&self, session: SignalingSession) {
        let SignalingSession {
            outbound,
            mut inbound,
        } = session;
        *self.inner.signaling_tx.lock().await = Some(outbound);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match frame.kind {
                    SignalKind::Offer => inner.handle_offer(frame).await,
                    SignalKind::Answer => {
                        if let Err(e) = inner
                            .driver
                            .apply_answer(&frame.source_id, &frame.payload)
                            .await
                        {
                            warn!(peer = %frame.source_id, error = %e, "failed to apply answer");
                        }
                    }
                    SignalKind::Candidate => {
                        if let Err(e) = inner
                            .driver
                            .apply_candidate(&frame.source_id, &frame.payload)
                            .await
                        {
                            debug!(peer = %frame.source_id, error = %e, "failed to apply candidate");
                        }
                    }
                }
            }
            debug!("signaling stream ended");
        });
        *self.inner.signaling_task.lock().await = Some(task);
    }

    /// Initiate a connection to a peer via Hub signaling.
    pub async fn connect(&self, target_id: &str) -> Result<(), TransportError> {
        if self.inner.peers.read().await.contains_key(target_id) {
            return Err(TransportError::Signaling(format!(
                "already connected to {target_id}"
            )));
        }

        let (handle, offer) = self.inner.driver.create_offer(target_id).await?;
        self.inner.install_peer(target_id, handle).await;
        self.inner
            .send_signal(target_id, SignalKind::Offer, offer)
            .await
    }

    /// Whether a channel to the peer is currently open.
    pub async fn is_connected(&self, peer_id: &str) -> bool {
        match self.inner.peers.read().await.get(peer_id) {
            Some(peer) => peer.channel.is_open(),
            None => false,
        }
    }

    /// Whether the peer session has completed the handshake.
    pub async fn is_authenticated(&self, peer_id: &str) -> bool {
        let peer = match self.inner.peers.read().await.get(peer_id) {
            Some(peer) => peer.clone(),
            None => return false,
        };
        let result = peer.auth.lock().await.stage == SessionStage::Authenticated;
        result
    }

    /// The identity a peer proved during the handshake, if authenticated.
    pub async fn verified_peer_id(&self, peer_id: &str) -> Option<String> {
        let peer = self.inner.peers.read().await.get(peer_id)?.clone();
        let auth = peer.auth.lock().await;
        if auth.stage == SessionStage::Authenticated {
            Some(auth.verified_id.clone())
        } else {
            None
        }
    }

    /// IDs of peers with an open channel.
    pub async fn connected_peers(&self) -> Vec<String> {
        self.inner
            .peers
            .read()
            .await
            .iter()
            .filter(|(_, peer)| peer.channel.is_open())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether any peer channel is open.
    pub async fn has_connected_peers(&self) -> bool {
        !self.connected_peers().await.is_empty()
    }

    /// Send a raw frame to a peer.
    pub async fn send(&self, peer_id: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let peer = self
            .inner
            .peers
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(peer_id.to_string()))?;
        peer.channel.send(data).await
    }

    /// Send a command message and wait for the correlated response.
    ///
    /// The message must carry a request ID. The message is encrypted to
    /// the peer's verified key; exactly one matching response is delivered
    /// or the call times out, after which late responses are dropped.
    pub async fn send_command_and_wait(
        &self,
        peer_id: &str,
        msg: P2pMessage,
        timeout: Option<Duration>,
    ) -> Result<P2pMessage, TransportError> {
        if msg.request_id.is_empty() {
            return Err(TransportError::MissingRequestId);
        }
        let timeout = timeout.unwrap_or(self.inner.default_timeout);

        if !self.is_authenticated(peer_id).await {
            return Err(TransportError::PeerUnauthenticated(peer_id.to_string()));
        }
        let key = self
            .peer_key(peer_id)
            .await
            .ok_or_else(|| TransportError::PeerUnauthenticated(peer_id.to_string()))?;

        let request_id = msg.request_id.clone();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .await
            .insert(request_id.clone(), tx);

        let result = async {
            let wire = encrypt_message(&msg, &key)?;
            self.send(peer_id, wire).await
        }
        .await;
        if let Err(e) = result {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                // Sender dropped without a response (transport closing).
                self.inner.pending.lock().await.remove(&request_id);
                Err(TransportError::ChannelClosed)
            }
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Send an encrypted approval decision to a node.
    pub async fn send_approval_decision(
        &self,
        peer_id: &str,
        decision: &ApprovalDecision,
    ) -> Result<(), TransportError> {
        if !self.is_authenticated(peer_id).await {
            return Err(TransportError::PeerUnauthenticated(peer_id.to_string()));
        }
        let key = self
            .peer_key(peer_id)
            .await
            .ok_or_else(|| TransportError::PeerUnauthenticated(peer_id.to_string()))?;

        let msg = P2pMessage::new(MessageKind::ApprovalDecision, decision)?;
        let wire = encrypt_message(&msg, &key)?;
        self.send(peer_id, wire).await
    }

    /// Broadcast an encrypted approval request to every authenticated
    /// peer. Returns how many peers it was sent to.
    pub async fn send_approval_request(&self, request: &ApprovalRequest) -> usize {
        let peers: Vec<Arc<Peer>> = self.inner.peers.read().await.values().cloned().collect();

        let mut sent = 0;
        for peer in peers {
            if peer.auth.lock().await.stage != SessionStage::Authenticated {
                continue;
            }
            let Some(key) = self.peer_key(&peer.remote_id).await else {
                debug!(peer = %peer.remote_id, "no key for authenticated peer, skipping");
                continue;
            };
            // Fresh message per peer so nonces stay unique.
            let wire = match P2pMessage::new(MessageKind::ApprovalRequest, request)
                .and_then(|msg| encrypt_message(&msg, &key))
            {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(peer = %peer.remote_id, error = %e, "failed to encrypt approval request");
                    continue;
                }
            };
            match peer.channel.send(wire).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %peer.remote_id, error = %e, "failed to send approval request"),
            }
        }
        sent
    }

    /// Close all sessions and stop background tasks.
    pub async fn close(&self) {
        if let Some(task) = self.inner.signaling_task.lock().await.take() {
            task.abort();
        }
        *self.inner.signaling_tx.lock().await = None;

        // Dropping the senders wakes all pending waiters with an error.
        self.inner.pending.lock().await.clear();

        let peers: Vec<Arc<Peer>> = self.inner.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.channel.close().await;
            if let Some(task) = peer.task.lock().await.take() {
                task.abort();
            }
        }

        self.inner.nonces.stop();
    }
}

impl Inner {
    fn handler<T: Clone>(&self, pick: impl Fn(&Handlers) -> Option<T>) -> Option<T> {
        pick(&self.handlers.read().expect("handlers poisoned"))
    }

    fn trust_root(&self) -> Option<Arc<TrustRoot>> {
        self.trust_root.read().expect("trust root poisoned").clone()
    }

    async fn send_signal(
        &self,
        target_id: &str,
        kind: SignalKind,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let tx = self
            .signaling_tx
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError::Signaling("signaling not started".to_string()))?;
        tx.send(SignalFrame {
            target_id: target_id.to_string(),
            source_id: self.local_id.clone(),
            kind,
            payload,
        })
        .await
        .map_err(|_| TransportError::Signaling("signaling stream closed".to_string()))
    }

    /// Process an inbound connection offer on the bounded worker pool.
    async fn handle_offer(self: &Arc<Self>, frame: SignalFrame) {
        let source_id = frame.source_id.clone();

        // A duplicate offer must not overwrite a live session.
        if self.peers.read().await.contains_key(&source_id) {
            warn!(peer = %source_id, "ignoring duplicate offer");
            return;
        }

        let Ok(permit) = self.offer_permits.clone().try_acquire_owned() else {
            warn!(peer = %source_id, "dropping offer: handshake capacity exhausted");
            return;
        };

        let inner = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match inner.driver.accept_offer(&source_id, &frame.payload).await {
                Ok((handle, answer)) => {
                    inner.install_peer(&source_id, handle).await;
                    if let Err(e) = inner
                        .send_signal(&source_id, SignalKind::Answer, answer)
                        .await
                    {
                        warn!(peer = %source_id, error = %e, "failed to send answer");
                    }
                }
                Err(e) => {
                    warn!(peer = %source_id, error = %e, "failed to accept offer");
                }
            }
        });
    }

    /// Register a peer session and start its receive loop. If a session
    /// for the remote ID already exists the new channel is discarded
    /// instead of overwriting it.
    async fn install_peer(self: &Arc<Self>, remote_id: &str, handle: ChannelHandle) -> Arc<Peer> {
        let peer = Arc::new(Peer {
            remote_id: remote_id.to_string(),
            channel: handle.channel,
            auth: Mutex::new(AuthState {
                stage: SessionStage::Init,
                challenge: None,
                verified_id: String::new(),
            }),
            task: Mutex::new(None),
        });

        {
            let mut peers = self.peers.write().await;
            if let Some(existing) = peers.get(remote_id) {
                let existing = existing.clone();
                drop(peers);
                warn!(peer = %remote_id, "session already exists, discarding new channel");
                peer.channel.close().await;
                return existing;
            }
            peers.insert(remote_id.to_string(), peer.clone());
        }

        let inner = self.clone();
        let loop_peer = peer.clone();
        let mut events = handle.events;
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Open => inner.on_channel_open(&loop_peer).await,
                    ChannelEvent::Message(data) => inner.on_frame(&loop_peer, data).await,
                    ChannelEvent::Closed => break,
                }
            }
            inner.teardown_peer(&loop_peer).await;
        });
        *peer.task.lock().await = Some(task);

        peer
    }

    async fn on_channel_open(self: &Arc<Self>, peer: &Arc<Peer>) {
        debug!(peer = %peer.remote_id, "data channel open");
        self.send_challenge(peer).await;
    }

    /// Issue our challenge, once per session.
    async fn send_challenge(self: &Arc<Self>, peer: &Arc<Peer>) {
        let nonce = match crypto::generate_random_bytes(CHALLENGE_SIZE) {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(peer = %peer.remote_id, error = %e, "cannot generate auth challenge");
                self.fail_session(peer, "challenge generation failed").await;
                return;
            }
        };

        {
            let mut auth = peer.auth.lock().await;
            match auth.stage {
                SessionStage::Authenticated | SessionStage::Failed => return,
                _ => {}
            }
            if auth.challenge.is_some() {
                return; // already issued
            }
            auth.challenge = Some(nonce.clone());
            auth.stage = SessionStage::ChallengeSent;
        }

        let msg = AuthMessage::Challenge {
            nonce,
            claimed_id: self.local_id.clone(),
            public_key: self.identity.verifying_key().as_bytes().to_vec(),
            cert_pem: self.identity_cert_string(),
        };
        self.send_auth_message(peer, &msg).await;
        debug!(peer = %peer.remote_id, "sent auth challenge");
    }

    fn identity_cert_string(&self) -> String {
        self.identity
            .cert_pem()
            .map(|pem| String::from_utf8_lossy(pem).to_string())
            .unwrap_or_default()
    }

    async fn send_auth_message(&self, peer: &Arc<Peer>, msg: &AuthMessage) {
        match msg.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = peer.channel.send(bytes).await {
                    warn!(peer = %peer.remote_id, error = %e, "failed to send auth message");
                }
            }
            Err(e) => warn!(peer = %peer.remote_id, error = %e, "failed to encode auth message"),
        }
    }

    async fn on_frame(self: &Arc<Self>, peer: &Arc<Peer>, data: Vec<u8>) {
        let authenticated = peer.auth.lock().await.stage == SessionStage::Authenticated;
        if !authenticated {
            match AuthMessage::from_bytes(&data) {
                Ok(msg) => self.handle_auth_message(peer, msg).await,
                Err(_) => {
                    debug!(peer = %peer.remote_id, "dropping non-handshake frame from unauthenticated peer");
                }
            }
            return;
        }
        self.handle_app_frame(peer, data).await;
    }

    async fn handle_auth_message(self: &Arc<Self>, peer: &Arc<Peer>, msg: AuthMessage) {
        match msg {
            AuthMessage::Challenge {
                nonce,
                claimed_id,
                public_key,
                cert_pem,
            } => {
                self.handle_challenge(peer, nonce, claimed_id, public_key, cert_pem)
                    .await
            }
            AuthMessage::Response {
                claimed_id,
                public_key,
                cert_pem,
                signature,
                echoed_nonce,
            } => {
                self.handle_response(peer, claimed_id, public_key, cert_pem, signature, echoed_nonce)
                    .await
            }
            AuthMessage::Success => {
                debug!(peer = %peer.remote_id, "auth success confirmed by peer");
            }
            AuthMessage::Failed => {
                warn!(peer = %peer.remote_id, "peer reported auth failure, closing");
                peer.auth.lock().await.stage = SessionStage::Failed;
                peer.channel.close().await;
            }
        }
    }

    async fn handle_challenge(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        nonce: Vec<u8>,
        claimed_id: String,
        public_key: Vec<u8>,
        cert_pem: String,
    ) {
        debug!(peer = %peer.remote_id, claimed = %claimed_id, "received auth challenge");

        let claimed_key = match crypto::parse_public_key(&public_key) {
            Ok(key) => key,
            Err(_) => {
                self.fail_session(peer, "challenge carried an invalid public key")
                    .await;
                return;
            }
        };

        if let Some(root) = self.trust_root() {
            if cert_pem.is_empty() {
                self.fail_session(peer, "peer did not present a certificate")
                    .await;
                return;
            }
            if let Err(e) = root.verify_peer(&cert_pem, &claimed_key) {
                warn!(peer = %peer.remote_id, error = %e, "peer certificate rejected");
                self.fail_session(peer, "certificate verification failed")
                    .await;
                return;
            }
        }

        let signature = crypto::sign(&nonce, self.identity.signing_key());
        let response = AuthMessage::Response {
            claimed_id: self.local_id.clone(),
            public_key: self.identity.verifying_key().as_bytes().to_vec(),
            cert_pem: self.identity_cert_string(),
            signature,
            echoed_nonce: nonce,
        };
        self.send_auth_message(peer, &response).await;
        debug!(peer = %peer.remote_id, "sent auth response");

        let needs_own_challenge = {
            let mut auth = peer.auth.lock().await;
            if auth.stage == SessionStage::Init {
                auth.stage = SessionStage::ChallengeReceived;
            }
            auth.challenge.is_none() && auth.stage != SessionStage::Authenticated
        };
        // Continue the cycle in the other direction.
        if needs_own_challenge {
            self.send_challenge(peer).await;
        }
    }

    async fn handle_response(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        claimed_id: String,
        public_key: Vec<u8>,
        cert_pem: String,
        signature: Vec<u8>,
        echoed_nonce: Vec<u8>,
    ) {
        debug!(peer = %peer.remote_id, claimed = %claimed_id, "received auth response");

        let outstanding = peer.auth.lock().await.challenge.clone();
        let Some(outstanding) = outstanding else {
            self.fail_session(peer, "response without outstanding challenge")
                .await;
            return;
        };

        if !crypto::secure_compare(&echoed_nonce, &outstanding) {
            self.fail_session(peer, "challenge mismatch").await;
            return;
        }

        let peer_key = match crypto::parse_public_key(&public_key) {
            Ok(key) => key,
            Err(_) => {
                self.fail_session(peer, "response carried an invalid public key")
                    .await;
                return;
            }
        };

        if let Some(root) = self.trust_root() {
            if cert_pem.is_empty() {
                self.fail_session(peer, "peer did not present a certificate")
                    .await;
                return;
            }
            if let Err(e) = root.verify_peer(&cert_pem, &peer_key) {
                warn!(peer = %peer.remote_id, error = %e, "peer certificate rejected");
                self.fail_session(peer, "certificate verification failed")
                    .await;
                return;
            }
        }

        if crypto::verify(&outstanding, &signature, &peer_key).is_err() {
            self.fail_session(peer, "challenge signature invalid").await;
            return;
        }

        {
            let mut auth = peer.auth.lock().await;
            auth.stage = SessionStage::Authenticated;
            auth.verified_id = claimed_id.clone();
            auth.challenge = None;
        }
        self.peer_keys
            .write()
            .await
            .insert(peer.remote_id.clone(), peer_key);

        info!(peer = %peer.remote_id, verified = %claimed_id, "peer authenticated");
        self.send_auth_message(peer, &AuthMessage::Success).await;

        if let Some(handler) = self.handler(|h| h.peer_status.clone()) {
            handler(&peer.remote_id, true);
        }
    }

    /// Reject the session: notify the peer, close the channel.
    async fn fail_session(self: &Arc<Self>, peer: &Arc<Peer>, reason: &str) {
        warn!(peer = %peer.remote_id, reason, "auth failed, closing connection");
        peer.auth.lock().await.stage = SessionStage::Failed;
        self.send_auth_message(peer, &AuthMessage::Failed).await;
        tokio::time::sleep(AUTH_FAIL_SEND_DELAY).await;
        peer.channel.close().await;
    }

    async fn handle_app_frame(self: &Arc<Self>, peer: &Arc<Peer>, data: Vec<u8>) {
        // Hard requirement: everything after authentication is encrypted.
        let msg = match decrypt_message(&data, self.identity.signing_key()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %peer.remote_id, error = %e, "rejecting undecryptable frame");
                return;
            }
        };

        if !self.nonces.check(&msg.nonce, msg.timestamp) {
            warn!(peer = %peer.remote_id, nonce = %msg.nonce, "rejecting replayed or stale message");
            return;
        }

        match msg.kind {
            MessageKind::ApprovalRequest => match msg.parse_approval_request() {
                Ok(request) => {
                    if let Some(handler) = self.handler(|h| h.approval_request.clone()) {
                        handler(&peer.remote_id, request);
                    }
                }
                Err(e) => warn!(peer = %peer.remote_id, error = %e, "bad approval request"),
            },
            MessageKind::ApprovalDecision => match msg.parse_approval_decision() {
                Ok(decision) => {
                    if let Some(handler) = self.handler(|h| h.approval_decision.clone()) {
                        handler(&peer.remote_id, decision);
                    }
                }
                Err(e) => warn!(peer = %peer.remote_id, error = %e, "bad approval decision"),
            },
            MessageKind::CommandResponse => {
                if let Ok(response) = msg.parse_command_response() {
                    if !response.request_id.is_empty()
                        && self.deliver_response(&response.request_id, msg.clone()).await
                    {
                        return;
                    }
                }
                self.forward_to_message_handler(peer, &msg);
            }
            MessageKind::Command => {
                if let Some(handler) = self.handler(|h| h.command.clone()) {
                    match msg.parse_command() {
                        Ok(command) => {
                            self.spawn_command_responder(peer, command, msg.request_id.clone(), handler)
                                .await
                        }
                        Err(e) => warn!(peer = %peer.remote_id, error = %e, "bad command payload"),
                    }
                } else {
                    self.forward_to_message_handler(peer, &msg);
                }
            }
            MessageKind::Metrics | MessageKind::Encrypted => {
                self.forward_to_message_handler(peer, &msg);
            }
        }
    }

    fn forward_to_message_handler(&self, peer: &Arc<Peer>, msg: &P2pMessage) {
        if let Some(handler) = self.handler(|h| h.message.clone()) {
            let payload = serde_json::to_vec(&msg.payload).unwrap_or_default();
            handler(&peer.remote_id, payload);
        }
    }

    /// Run the command handler and send back the encrypted response.
    async fn spawn_command_responder(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        command: CommandPayload,
        request_id: String,
        handler: CommandHandler,
    ) {
        let inner = self.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            let response = handler(peer.remote_id.clone(), command, request_id.clone()).await;

            let key = match inner.peer_keys.read().await.get(&peer.remote_id).copied() {
                Some(key) => key,
                None => {
                    warn!(peer = %peer.remote_id, "no key to encrypt command response");
                    return;
                }
            };

            let result = P2pMessage::with_request_id(
                MessageKind::CommandResponse,
                request_id,
                &response,
            )
            .and_then(|msg| encrypt_message(&msg, &key));
            match result {
                Ok(wire) => {
                    if let Err(e) = peer.channel.send(wire).await {
                        warn!(peer = %peer.remote_id, error = %e, "failed to send command response");
                    }
                }
                Err(e) => warn!(peer = %peer.remote_id, error = %e, "failed to build command response"),
            }
        });
    }

    /// Hand a response to the waiter registered under its request ID.
    async fn deliver_response(&self, request_id: &str, msg: P2pMessage) -> bool {
        let sender = self.pending.lock().await.remove(request_id);
        match sender {
            Some(sender) => sender.send(msg).is_ok(),
            None => false,
        }
    }

    async fn teardown_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        self.peers.write().await.remove(&peer.remote_id);
        let was_authenticated = {
            let auth = peer.auth.lock().await;
            auth.stage == SessionStage::Authenticated
        };
        debug!(peer = %peer.remote_id, was_authenticated, "peer session closed");

        if was_authenticated {
            if let Some(handler) = self.handler(|h| h.peer_status.clone()) {
                handler(&peer.remote_id, false);
            }
        }
    }
}
