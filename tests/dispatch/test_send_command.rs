// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! End-to-end dispatch through the Hub relay and direct channels.

use std::sync::Arc;

use veilink::dispatch::{DirectConnection, DispatchError, Dispatcher};
use veilink::routing::derive_routing_token;
use veilink::{CommandType, Config, Identity};

use crate::support::{echo_receiver, LoopbackDirect, LoopbackHub};

struct HubFixture {
    dispatcher: Dispatcher,
    hub: Arc<LoopbackHub>,
    node_id: &'static str,
}

async fn hub_fixture(strip_signature: bool) -> HubFixture {
    let node_id = "node-1";
    let controller = Arc::new(Identity::generate().unwrap());
    let node = Arc::new(Identity::generate().unwrap());
    let node_key = node.verifying_key();

    let secret = veilink::generate_routing_secret().unwrap();
    let receiver = echo_receiver(node);

    let mut hub = LoopbackHub::new(receiver, controller.verifying_key());
    hub.expected_token = Some(derive_routing_token(node_id, &secret));
    hub.strip_signature = strip_signature;
    let hub = Arc::new(hub);

    let dispatcher = Dispatcher::new(&Config::default());
    dispatcher.set_identity(controller).await;
    dispatcher.set_hub(hub.clone()).await;
    dispatcher.set_routing_secret(secret).await;
    dispatcher.register_node_key(node_id, node_key).await;

    HubFixture {
        dispatcher,
        hub,
        node_id,
    }
}

#[tokio::test]
async fn test_hub_relay_roundtrip() {
    let fx = hub_fixture(false).await;

    let result = fx
        .dispatcher
        .send_command(fx.node_id, CommandType::Ping, b"hello node".to_vec(), None)
        .await
        .unwrap();

    assert!(result.is_ok());
    assert_eq!(result.response_payload, b"hello node");

    // The hub saw exactly one call, addressed by the expected blind token.
    assert_eq!(fx.hub.calls().await, 1);
}

#[tokio::test]
async fn test_unsigned_response_rejected() {
    let fx = hub_fixture(true).await;

    let err = fx
        .dispatcher
        .send_command(fx.node_id, CommandType::Ping, Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ResponseUnsigned(_)));
}

#[tokio::test]
async fn test_remote_error_surfaces() {
    let fx = hub_fixture(false).await;

    // The echo handler fails Status commands.
    let err = fx
        .dispatcher
        .send_command_ok(fx.node_id, CommandType::Status, Vec::new(), None)
        .await
        .unwrap_err();
    match err {
        DispatchError::Remote(message) => assert_eq!(message, "status unavailable"),
        other => panic!("expected Remote, got {other:?}"),
    }
}

#[tokio::test]
async fn test_identity_required() {
    let dispatcher = Dispatcher::new(&Config::default());
    let err = dispatcher
        .send_command("node-1", CommandType::Ping, Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::IdentityUnavailable));
}

#[tokio::test]
async fn test_missing_node_key() {
    let controller = Arc::new(Identity::generate().unwrap());
    let node = Arc::new(Identity::generate().unwrap());
    let receiver = echo_receiver(node);
    let hub = Arc::new(LoopbackHub::new(receiver, controller.verifying_key()));

    let dispatcher = Dispatcher::new(&Config::default());
    dispatcher.set_identity(controller).await;
    dispatcher.set_hub(hub).await;

    let err = dispatcher
        .send_command("node-1", CommandType::Ping, Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::MissingNodeKey(_)));
}

#[tokio::test]
async fn test_no_hub_means_no_route() {
    let controller = Arc::new(Identity::generate().unwrap());
    let dispatcher = Dispatcher::new(&Config::default());
    dispatcher.set_identity(controller).await;

    let err = dispatcher
        .send_command("node-1", CommandType::Ping, Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoRoute(_)));
}

#[tokio::test]
async fn test_direct_connection_takes_priority() {
    let node_id = "node-local";
    let controller = Arc::new(Identity::generate().unwrap());
    let node = Arc::new(Identity::generate().unwrap());
    let node_key = node.verifying_key();
    let receiver = echo_receiver(node);

    // A hub is configured too, but the direct channel must win.
    let hub = Arc::new(LoopbackHub::new(
        receiver.clone(),
        controller.verifying_key(),
    ));

    let dispatcher = Dispatcher::new(&Config::default());
    dispatcher.set_identity(controller.clone()).await;
    dispatcher.set_hub(hub.clone()).await;
    dispatcher
        .set_direct_connection(
            node_id,
            DirectConnection {
                channel: Arc::new(LoopbackDirect::new(
                    receiver,
                    controller.verifying_key(),
                    "bearer-xyz",
                )),
                bearer_token: "bearer-xyz".to_string(),
                node_public_key: node_key,
            },
        )
        .await;

    let result = dispatcher
        .send_command(node_id, CommandType::ListRules, b"{}".to_vec(), None)
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(result.response_payload, b"{}");
    assert_eq!(hub.calls().await, 0, "hub must not be touched");
}

#[tokio::test]
async fn test_direct_channel_bearer_mismatch_surfaces() {
    let node_id = "node-local";
    let controller = Arc::new(Identity::generate().unwrap());
    let node = Arc::new(Identity::generate().unwrap());
    let node_key = node.verifying_key();
    let receiver = echo_receiver(node);

    let dispatcher = Dispatcher::new(&Config::default());
    dispatcher.set_identity(controller.clone()).await;
    dispatcher
        .set_direct_connection(
            node_id,
            DirectConnection {
                channel: Arc::new(LoopbackDirect::new(
                    receiver,
                    controller.verifying_key(),
                    "expected-token",
                )),
                bearer_token: "wrong-token".to_string(),
                node_public_key: node_key,
            },
        )
        .await;

    let err = dispatcher
        .send_command(node_id, CommandType::Ping, Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Direct(_)));
}

#[tokio::test]
async fn test_replayed_command_rejected_by_node() {
    // Replay an entire captured envelope against the node; the node's
    // replay guard must reject the second delivery.
    use veilink::crypto;
    use veilink::dispatch::{
        new_request_id, CommandResult, InnerCommand, SecureCommandPayload,
    };

    let controller = Arc::new(Identity::generate().unwrap());
    let node = Arc::new(Identity::generate().unwrap());
    let receiver = echo_receiver(node.clone());

    let inner = InnerCommand {
        command_type: CommandType::Ping,
        payload: Vec::new(),
    };
    let secure = SecureCommandPayload::new(
        new_request_id().unwrap(),
        serde_json::to_vec(&inner).unwrap(),
    );
    let envelope = crypto::encrypt_with_signature(
        &serde_json::to_vec(&secure).unwrap(),
        &node.verifying_key(),
        controller.signing_key(),
        controller.fingerprint(),
    )
    .unwrap();

    let reply = receiver
        .handle_envelope(&envelope, &controller.verifying_key())
        .await
        .unwrap();
    let result: CommandResult = serde_json::from_slice(
        &crypto::decrypt(&reply, controller.signing_key()).unwrap(),
    )
    .unwrap();
    assert!(result.is_ok());

    // Byte-for-byte replay of the same envelope.
    let err = receiver
        .handle_envelope(&envelope, &controller.verifying_key())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Replay(_)));
}
