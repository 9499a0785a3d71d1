// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Encrypted messaging and request/response correlation over P2P.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use veilink::dispatch::{new_request_id, CommandType, ReplayGuard};
use veilink::p2p::{
    ApprovalAction, ApprovalDecision, ApprovalRequest, CommandPayload, MemoryNetwork, MessageKind,
    P2pMessage, Transport, TransportError,
};
use veilink::{Config, Identity};

use crate::support::{p2p_echo_handler, wait_until, SignalingHub};

async fn authenticated_pair(config: &Config) -> (Transport, Transport) {
    crate::support::init_tracing();
    let hub = SignalingHub::new();
    let network = MemoryNetwork::new();

    let controller = Arc::new(Identity::generate().unwrap());
    let node = Arc::new(Identity::generate().unwrap());

    let ta = Transport::new("ctrl", controller, network.clone(), config);
    let tb = Transport::new("node", node, network.clone(), config);

    ta.start(hub.session("ctrl").await).await;
    tb.start(hub.session("node").await).await;
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

    (ta, tb)
}

#[tokio::test]
async fn test_command_roundtrip_over_p2p() {
    let config = Config::default();
    let (ta, tb) = authenticated_pair(&config).await;

    let guard = Arc::new(ReplayGuard::new(Duration::from_secs(60), None));
    tb.set_command_handler(p2p_echo_handler(guard));

    let request_id = new_request_id().unwrap();
    let command = CommandPayload {
        command_type: CommandType::Ping,
        data: serde_json::to_vec(&veilink::dispatch::SecureCommandPayload::new(
            request_id.clone(),
            serde_json::to_vec(&veilink::dispatch::InnerCommand {
                command_type: CommandType::Ping,
                payload: b"over-p2p".to_vec(),
            })
            .unwrap(),
        ))
        .unwrap(),
    };
    let msg =
        P2pMessage::with_request_id(MessageKind::Command, request_id.clone(), &command).unwrap();

    let response = ta
        .send_command_and_wait("node", msg, Some(Duration::from_secs(3)))
        .await
        .unwrap();
    let response = response.parse_command_response().unwrap();
    assert_eq!(response.request_id, request_id);
    assert_eq!(response.status, "OK");
    assert_eq!(response.data, b"over-p2p");

    ta.close().await;
    tb.close().await;
}

#[tokio::test]
async fn test_command_without_request_id_rejected() {
    let config = Config::default();
    let (ta, tb) = authenticated_pair(&config).await;

    let msg = P2pMessage::new(MessageKind::Command, &serde_json::json!({})).unwrap();
    let err = ta
        .send_command_and_wait("node", msg, Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::MissingRequestId));

    ta.close().await;
    tb.close().await;
}

#[tokio::test]
async fn test_command_to_unauthenticated_peer_rejected() {
    let config = Config::default();
    let network = MemoryNetwork::new();
    let identity = Arc::new(Identity::generate().unwrap());
    let ta = Transport::new("ctrl", identity, network, &config);

    let msg = P2pMessage::with_request_id(
        MessageKind::Command,
        new_request_id().unwrap(),
        &serde_json::json!({}),
    )
    .unwrap();
    let err = ta
        .send_command_and_wait("nowhere", msg, Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::PeerUnauthenticated(_)));

    ta.close().await;
}

#[tokio::test]
async fn test_unanswered_command_times_out() {
    let config = Config::default();
    // No command handler registered on the node: the command is dropped
    // and the waiter must time out.
    let (ta, tb) = authenticated_pair(&config).await;

    let msg = P2pMessage::with_request_id(
        MessageKind::Command,
        new_request_id().unwrap(),
        &serde_json::json!({}),
    )
    .unwrap();
    let err = ta
        .send_command_and_wait("node", msg, Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));

    ta.close().await;
    tb.close().await;
}

#[tokio::test]
async fn test_approval_flow_both_directions() {
    let config = Config::default();
    let (ta, tb) = authenticated_pair(&config).await;

    let requests: Arc<Mutex<Vec<(String, ApprovalRequest)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_requests = requests.clone();
    ta.set_approval_request_handler(move |peer, request| {
        seen_requests
            .lock()
            .unwrap()
            .push((peer.to_string(), request));
    });

    let decisions: Arc<Mutex<Vec<(String, ApprovalDecision)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_decisions = decisions.clone();
    tb.set_approval_decision_handler(move |peer, decision| {
        seen_decisions
            .lock()
            .unwrap()
            .push((peer.to_string(), decision));
    });

    // Node broadcasts an approval request to its authenticated peers.
    let request = ApprovalRequest {
        request_id: "apr-1".into(),
        node_id: "node".into(),
        proxy_id: "proxy-1".into(),
        source_ip: "203.0.113.9".into(),
        dest_addr: "internal:5432".into(),
        rule_id: "rule-7".into(),
        geo_country: "NL".into(),
        geo_city: String::new(),
        geo_isp: String::new(),
        severity: "high".into(),
    };
    assert_eq!(tb.send_approval_request(&request).await, 1);

    let r = requests.clone();
    assert!(wait_until(|| {
        let r = r.clone();
        async move { !r.lock().unwrap().is_empty() }
    })
    .await);
    {
        let seen = requests.lock().unwrap();
        assert_eq!(seen[0].0, "ctrl");
        assert_eq!(seen[0].1.request_id, "apr-1");
        assert_eq!(seen[0].1.source_ip, "203.0.113.9");
    }

    // Controller answers with a decision.
    ta.send_approval_decision(
        "node",
        &ApprovalDecision {
            request_id: "apr-1".into(),
            action: ApprovalAction::Block,
            duration_seconds: 600,
            reason: "unknown destination".into(),
        },
    )
    .await
    .unwrap();

    let d = decisions.clone();
    assert!(wait_until(|| {
        let d = d.clone();
        async move { !d.lock().unwrap().is_empty() }
    })
    .await);
    {
        let seen = decisions.lock().unwrap();
        assert_eq!(seen[0].0, "ctrl");
        assert_eq!(seen[0].1.request_id, "apr-1");
        assert_eq!(seen[0].1.action, ApprovalAction::Block);
    }

    ta.close().await;
    tb.close().await;
}
