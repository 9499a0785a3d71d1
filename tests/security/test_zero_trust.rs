// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The invariants the zero-trust model stands on, exercised through the
//! public API.

use veilink::crypto::{self, CryptoError};
use veilink::routing::{derive_routing_token, verify_routing_token};
use veilink::Identity;

#[test]
fn test_hello_roundtrip_and_wrong_key() {
    let recipient = Identity::generate().unwrap();
    let stranger = Identity::generate().unwrap();

    let envelope = crypto::encrypt(b"hello", &recipient.verifying_key()).unwrap();

    let plaintext = crypto::decrypt(&envelope, recipient.signing_key()).unwrap();
    assert_eq!(plaintext, b"hello");

    let err = crypto::decrypt(&envelope, stranger.signing_key()).unwrap_err();
    assert!(matches!(err, CryptoError::DecryptFailed));
}

#[test]
fn test_relay_cannot_read_or_forge() {
    let controller = Identity::generate().unwrap();
    let node = Identity::generate().unwrap();

    let envelope = crypto::encrypt_with_signature(
        b"{\"command\":\"status\"}",
        &node.verifying_key(),
        controller.signing_key(),
        controller.fingerprint(),
    )
    .unwrap();

    // What the relay sees contains no trace of the plaintext.
    let visible = serde_json::to_string(&envelope).unwrap();
    assert!(!visible.contains("status"));

    // A relay re-signing the envelope with its own key does not pass as
    // the controller.
    let relay = Identity::generate().unwrap();
    let mut forged = envelope.clone();
    forged.signature = crypto::sign(
        &[
            forged.ephemeral_public_key.clone(),
            forged.nonce.clone(),
            forged.ciphertext.clone(),
        ]
        .concat(),
        relay.signing_key(),
    );
    let err = crypto::verify_signature(&forged, &controller.verifying_key()).unwrap_err();
    assert!(matches!(err, CryptoError::SignatureInvalid));
}

#[test]
fn test_routing_tokens_do_not_correlate_across_secrets() {
    // Two principals watching the same node derive unrelated tokens.
    let s1 = veilink::generate_routing_secret().unwrap();
    let s2 = veilink::generate_routing_secret().unwrap();

    let t1 = derive_routing_token("n1", &s1);
    let t2 = derive_routing_token("n1", &s2);
    assert_ne!(t1, t2);

    // And a token says nothing without the right secret.
    assert!(verify_routing_token("n1", &s1, &t1));
    assert!(!verify_routing_token("n1", &s2, &t1));
}

#[test]
fn test_token_does_not_leak_node_id() {
    let secret = veilink::generate_routing_secret().unwrap();
    let token = derive_routing_token("production-db-gateway", &secret);
    assert!(!token.contains("production"));
    assert!(!token.contains("gateway"));
}
