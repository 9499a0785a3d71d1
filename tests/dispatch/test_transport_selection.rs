// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Transport fallback: direct → P2P → Hub relay.

use std::sync::Arc;
use std::time::Duration;

use veilink::dispatch::{DispatchError, Dispatcher, ReplayGuard};
use veilink::p2p::{MemoryNetwork, Transport};
use veilink::{CommandType, Config, Identity, P2pMode};

use crate::support::{echo_receiver, p2p_echo_handler, wait_until, LoopbackHub, SignalingHub};

struct P2pFixture {
    dispatcher: Dispatcher,
    hub: Arc<LoopbackHub>,
    controller_transport: Transport,
    node_transport: Transport,
    node_id: &'static str,
}

/// Dispatcher with a live authenticated P2P session to the node AND a
/// loopback hub, so fallback order is observable.
async fn p2p_fixture(mode: P2pMode) -> P2pFixture {
    crate::support::init_tracing();
    let node_id = "node";
    let signaling = SignalingHub::new();
    let network = MemoryNetwork::new();

    let controller = Arc::new(Identity::generate().unwrap());
    let node = Arc::new(Identity::generate().unwrap());
    let node_key = node.verifying_key();

    let config = Config {
        p2p_mode: mode,
        ..Config::default()
    };

    let controller_transport =
        Transport::new("ctrl", controller.clone(), network.clone(), &config);
    let node_transport = Transport::new(node_id, node.clone(), network.clone(), &config);
    node_transport.set_command_handler(p2p_echo_handler(Arc::new(ReplayGuard::new(
        Duration::from_secs(60),
        None,
    ))));

    controller_transport
        .start(signaling.session("ctrl").await)
        .await;
    node_transport.start(signaling.session(node_id).await).await;
    controller_transport.connect(node_id).await.unwrap();

    let t = controller_transport.clone();
    assert!(wait_until(|| {
        let t = t.clone();
        async move { t.is_authenticated("node").await }
    })
    .await);

    let receiver = echo_receiver(node);
    let hub = Arc::new(LoopbackHub::new(receiver, controller.verifying_key()));

    let dispatcher = Dispatcher::new(&config);
    dispatcher.set_identity(controller).await;
    dispatcher.set_hub(hub.clone()).await;
    dispatcher.set_transport(controller_transport.clone()).await;
    dispatcher.register_node_key(node_id, node_key).await;

    P2pFixture {
        dispatcher,
        hub,
        controller_transport,
        node_transport,
        node_id,
    }
}

#[tokio::test]
async fn test_auto_mode_prefers_p2p() {
    let fx = p2p_fixture(P2pMode::Auto).await;

    let result = fx
        .dispatcher
        .send_command(fx.node_id, CommandType::Ping, b"via p2p".to_vec(), None)
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(result.response_payload, b"via p2p");
    assert_eq!(fx.hub.calls().await, 0, "p2p path must not touch the hub");

    fx.controller_transport.close().await;
    fx.node_transport.close().await;
}

#[tokio::test]
async fn test_hub_only_mode_ignores_p2p_session() {
    let fx = p2p_fixture(P2pMode::HubOnly).await;

    let result = fx
        .dispatcher
        .send_command(fx.node_id, CommandType::Ping, b"via hub".to_vec(), None)
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(fx.hub.calls().await, 1, "hub-only mode must use the hub");

    fx.controller_transport.close().await;
    fx.node_transport.close().await;
}

#[tokio::test]
async fn test_auto_mode_falls_back_to_hub_when_session_gone() {
    let fx = p2p_fixture(P2pMode::Auto).await;

    // Tear the P2P session down; dispatch must quietly use the hub.
    fx.node_transport.close().await;
    let t = fx.controller_transport.clone();
    assert!(wait_until(|| {
        let t = t.clone();
        async move { !t.is_connected("node").await }
    })
    .await);

    let result = fx
        .dispatcher
        .send_command(fx.node_id, CommandType::Ping, b"fallback".to_vec(), None)
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(result.response_payload, b"fallback");
    assert_eq!(fx.hub.calls().await, 1);

    fx.controller_transport.close().await;
}

#[tokio::test]
async fn test_direct_only_mode_without_session_is_no_route() {
    let node_id = "node-unreachable";
    let controller = Arc::new(Identity::generate().unwrap());
    let node = Arc::new(Identity::generate().unwrap());

    let config = Config {
        p2p_mode: P2pMode::DirectOnly,
        ..Config::default()
    };

    let receiver = echo_receiver(node.clone());
    let hub = Arc::new(LoopbackHub::new(receiver, controller.verifying_key()));

    let dispatcher = Dispatcher::new(&config);
    dispatcher.set_identity(controller).await;
    dispatcher.set_hub(hub.clone()).await;
    dispatcher
        .register_node_key(node_id, node.verifying_key())
        .await;

    let err = dispatcher
        .send_command(node_id, CommandType::Ping, Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoRoute(_)));
    assert_eq!(
        hub.calls().await,
        0,
        "direct-only mode must never attempt the hub relay"
    );
}

#[tokio::test]
async fn test_direct_only_mode_uses_established_session() {
    let fx = p2p_fixture(P2pMode::DirectOnly).await;

    let result = fx
        .dispatcher
        .send_command(fx.node_id, CommandType::Ping, b"pinned".to_vec(), None)
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(result.response_payload, b"pinned");
    assert_eq!(fx.hub.calls().await, 0);

    fx.controller_transport.close().await;
    fx.node_transport.close().await;
}
