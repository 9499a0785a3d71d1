// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Challenge–response handshake over the in-process driver.

use std::sync::{Arc, Mutex};

use veilink::p2p::{AuthMessage, ChannelEvent, ChannelDriver, MemoryNetwork, Transport, TrustRoot};
use veilink::relay::{SignalFrame, SignalKind};
use veilink::{Config, Identity};

use crate::support::{wait_until, SignalingHub};

async fn transport_pair(
    config: &Config,
) -> (Transport, Transport, Arc<Identity>, Arc<Identity>) {
    crate::support::init_tracing();
    let hub = SignalingHub::new();
    let network = MemoryNetwork::new();

    let controller = Arc::new(Identity::generate().unwrap());
    let node = Arc::new(Identity::generate().unwrap());

    let ta = Transport::new("ctrl", controller.clone(), network.clone(), config);
    let tb = Transport::new("node", node.clone(), network.clone(), config);

    ta.start(hub.session("ctrl").await).await;
    tb.start(hub.session("node").await).await;

    (ta, tb, controller, node)
}

#[tokio::test]
async fn test_handshake_authenticates_both_sides() {
    let config = Config::default();
    let (ta, tb, controller, node) = transport_pair(&config).await;

    let statuses: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = statuses.clone();
    ta.set_peer_status_handler(move |peer, connected| {
        seen.lock().unwrap().push((peer.to_string(), connected));
    });

    ta.connect("node").await.unwrap();

    let a = ta.clone();
    assert!(wait_until(|| {
        let t = a.clone();
        async move { t.is_authenticated("node").await }
    })
    .await);
    let b = tb.clone();
    assert!(wait_until(|| {
        let t = b.clone();
        async move { t.is_authenticated("ctrl").await }
    })
    .await);

    // Each side recorded the identity the peer proved, and its key.
    assert_eq!(ta.verified_peer_id("node").await.as_deref(), Some("node"));
    assert_eq!(tb.verified_peer_id("ctrl").await.as_deref(), Some("ctrl"));
    assert_eq!(ta.peer_key("node").await, Some(node.verifying_key()));
    assert_eq!(tb.peer_key("ctrl").await, Some(controller.verifying_key()));

    // Exactly one connected notification for the transition.
    let events = statuses.lock().unwrap().clone();
    assert_eq!(
        events.iter().filter(|(p, c)| p == "node" && *c).count(),
        1,
        "expected one connected event, got {events:?}"
    );

    ta.close().await;
    tb.close().await;
}

#[tokio::test]
async fn test_duplicate_connect_rejected() {
    let config = Config::default();
    let (ta, tb, _, _) = transport_pair(&config).await;

    ta.connect("node").await.unwrap();
    let err = ta.connect("node").await.unwrap_err();
    assert!(err.to_string().contains("already connected"));

    ta.close().await;
    tb.close().await;
}

#[tokio::test]
async fn test_handshake_with_certificates() {
    let config = Config::default();
    let hub = SignalingHub::new();
    let network = MemoryNetwork::new();

    let ca = crate::support::TestCa::new();
    let controller = Arc::new(ca.issue_identity("ctrl"));
    let node = Arc::new(ca.issue_identity("node"));

    let ta = Transport::new("ctrl", controller, network.clone(), &config);
    let tb = Transport::new("node", node, network.clone(), &config);
    ta.set_trust_root(TrustRoot::from_key(ca.public_key));
    tb.set_trust_root(TrustRoot::from_key(ca.public_key));

    ta.start(hub.session("ctrl").await).await;
    tb.start(hub.session("node").await).await;

    ta.connect("node").await.unwrap();

    let a = ta.clone();
    assert!(wait_until(|| {
        let t = a.clone();
        async move { t.is_authenticated("node").await }
    })
    .await);

    ta.close().await;
    tb.close().await;
}

#[tokio::test]
async fn test_missing_certificate_rejected_when_root_pinned() {
    let config = Config::default();
    let hub = SignalingHub::new();
    let network = MemoryNetwork::new();

    let ca = crate::support::TestCa::new();
    // The node pins the root, the controller has no certificate at all.
    let controller = Arc::new(Identity::generate().unwrap());
    let node = Arc::new(ca.issue_identity("node"));

    let ta = Transport::new("ctrl", controller, network.clone(), &config);
    let tb = Transport::new("node", node, network.clone(), &config);
    tb.set_trust_root(TrustRoot::from_key(ca.public_key));

    ta.start(hub.session("ctrl").await).await;
    tb.start(hub.session("node").await).await;

    ta.connect("node").await.unwrap();

    // The node must tear the session down instead of authenticating.
    let b = tb.clone();
    assert!(wait_until(|| {
        let t = b.clone();
        async move { !t.is_connected("ctrl").await }
    })
    .await);
    assert!(!tb.is_authenticated("ctrl").await);

    ta.close().await;
    tb.close().await;
}

/// A hand-rolled peer that speaks the signaling and channel protocol
/// directly so tests can send malformed handshake messages.
struct RawPeer {
    handle: veilink::p2p::ChannelHandle,
}

impl RawPeer {
    /// Dial `target` through the signaling hub and return the raw channel.
    async fn dial(
        hub: &Arc<SignalingHub>,
        network: &Arc<MemoryNetwork>,
        local_id: &str,
        target: &str,
    ) -> Self {
        let mut session = hub.session(local_id).await;
        let (handle, offer) = network.create_offer(target).await.unwrap();
        session
            .outbound
            .send(SignalFrame {
                target_id: target.to_string(),
                source_id: local_id.to_string(),
                kind: SignalKind::Offer,
                payload: offer,
            })
            .await
            .unwrap();

        // Wait for the answer relayed back from the target.
        let answer = loop {
            let frame = session.inbound.recv().await.expect("answer frame");
            if frame.kind == SignalKind::Answer {
                break frame.payload;
            }
        };
        network.apply_answer(target, &answer).await.unwrap();

        Self { handle }
    }

    async fn next_event(&mut self) -> ChannelEvent {
        tokio::time::timeout(std::time::Duration::from_secs(3), self.handle.events.recv())
            .await
            .expect("event before timeout")
            .expect("channel event")
    }

    /// Wait for the peer's auth challenge.
    async fn recv_challenge(&mut self) -> Vec<u8> {
        loop {
            match self.next_event().await {
                ChannelEvent::Message(data) => {
                    if let Ok(AuthMessage::Challenge { nonce, .. }) = AuthMessage::from_bytes(&data)
                    {
                        return nonce;
                    }
                }
                ChannelEvent::Open => continue,
                ChannelEvent::Closed => panic!("channel closed before challenge"),
            }
        }
    }

    /// Wait for AuthFailed followed by channel close.
    async fn expect_rejection(&mut self) {
        loop {
            match self.next_event().await {
                ChannelEvent::Message(data) => {
                    if let Ok(AuthMessage::Failed) = AuthMessage::from_bytes(&data) {
                        return;
                    }
                }
                ChannelEvent::Closed => return,
                ChannelEvent::Open => continue,
            }
        }
    }
}

#[tokio::test]
async fn test_forged_signature_fails_session() {
    let config = Config::default();
    let hub = SignalingHub::new();
    let network = MemoryNetwork::new();

    let node = Arc::new(Identity::generate().unwrap());
    let tb = Transport::new("node", node, network.clone(), &config);
    tb.start(hub.session("node").await).await;

    let mut evil = RawPeer::dial(&hub, &network, "evil", "node").await;
    let challenge = evil.recv_challenge().await;

    // Sign the nonce with a key that does not match the claimed one.
    let real = Identity::generate().unwrap();
    let wrong = Identity::generate().unwrap();
    let response = AuthMessage::Response {
        claimed_id: "evil".to_string(),
        public_key: real.verifying_key().as_bytes().to_vec(),
        cert_pem: String::new(),
        signature: veilink::crypto::sign(&challenge, wrong.signing_key()),
        echoed_nonce: challenge,
    };
    evil.handle
        .channel
        .send(response.to_bytes().unwrap())
        .await
        .unwrap();

    evil.expect_rejection().await;
    assert!(!tb.is_authenticated("evil").await);

    tb.close().await;
}

#[tokio::test]
async fn test_tampered_echoed_nonce_fails_session() {
    let config = Config::default();
    let hub = SignalingHub::new();
    let network = MemoryNetwork::new();

    let node = Arc::new(Identity::generate().unwrap());
    let tb = Transport::new("node", node, network.clone(), &config);
    tb.start(hub.session("node").await).await;

    let mut evil = RawPeer::dial(&hub, &network, "evil", "node").await;
    let mut challenge = evil.recv_challenge().await;
    challenge[0] ^= 0xFF;

    let attacker = Identity::generate().unwrap();
    let response = AuthMessage::Response {
        claimed_id: "evil".to_string(),
        public_key: attacker.verifying_key().as_bytes().to_vec(),
        cert_pem: String::new(),
        signature: veilink::crypto::sign(&challenge, attacker.signing_key()),
        echoed_nonce: challenge,
    };
    evil.handle
        .channel
        .send(response.to_bytes().unwrap())
        .await
        .unwrap();

    evil.expect_rejection().await;
    assert!(!tb.is_authenticated("evil").await);

    tb.close().await;
}
