// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! In-Process Channel Driver
//!
//! A [`ChannelDriver`] that connects peers living in the same process over
//! in-memory pipes, with the same offer/answer/candidate shape as a real
//! NAT-traversal driver. Used by the test suites and by local development
//! setups where the full WebRTC stack would be noise.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::crypto::wipe::generate_random_bytes;
use crate::p2p::channel::{ChannelDriver, ChannelEvent, ChannelHandle, DataChannel};
use crate::p2p::error::TransportError;

const EVENT_BUFFER: usize = 64;

/// One half of an in-memory channel pair.
struct MemoryChannel {
    peer_events: mpsc::Sender<ChannelEvent>,
    local_events: mpsc::Sender<ChannelEvent>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.peer_events
            .send(ChannelEvent::Message(data))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.peer_events.send(ChannelEvent::Closed).await;
            let _ = self.local_events.send(ChannelEvent::Closed).await;
        }
    }
}

/// One endpoint of a pair: the handle given to the transport plus a sender
/// that can inject events into that handle's stream.
struct Endpoint {
    handle: ChannelHandle,
    events_tx: mpsc::Sender<ChannelEvent>,
}

struct PendingOffer {
    responder: Endpoint,
    open: Arc<AtomicBool>,
}

struct PendingAnswer {
    initiator_events_tx: mpsc::Sender<ChannelEvent>,
}

/// Rendezvous point shared by every in-process transport under test.
///
/// All transports take the same `Arc<MemoryNetwork>` as their driver; the
/// offer/answer payloads carry only an opaque rendezvous token.
#[derive(Default)]
pub struct MemoryNetwork {
    offers: Mutex<HashMap<String, PendingOffer>>,
    answers: Mutex<HashMap<String, PendingAnswer>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn channel_pair() -> (Endpoint, Endpoint, Arc<AtomicBool>) {
        let open = Arc::new(AtomicBool::new(false));
        let (a_tx, a_rx) = mpsc::channel(EVENT_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(EVENT_BUFFER);

        let a = MemoryChannel {
            peer_events: b_tx.clone(),
            local_events: a_tx.clone(),
            open: open.clone(),
        };
        let b = MemoryChannel {
            peer_events: a_tx.clone(),
            local_events: b_tx.clone(),
            open: open.clone(),
        };

        let initiator = Endpoint {
            handle: ChannelHandle {
                channel: Arc::new(a),
                events: a_rx,
            },
            events_tx: a_tx,
        };
        let responder = Endpoint {
            handle: ChannelHandle {
                channel: Arc::new(b),
                events: b_rx,
            },
            events_tx: b_tx,
        };

        (initiator, responder, open)
    }
}

#[async_trait]
impl ChannelDriver for MemoryNetwork {
    async fn create_offer(
        &self,
        _remote_id: &str,
    ) -> Result<(ChannelHandle, Vec<u8>), TransportError> {
        let token = hex::encode(generate_random_bytes(8)?);
        let (initiator, responder, open) = Self::channel_pair();

        self.offers
            .lock()
            .await
            .insert(token.clone(), PendingOffer { responder, open });
        self.answers.lock().await.insert(
            token.clone(),
            PendingAnswer {
                initiator_events_tx: initiator.events_tx,
            },
        );

        Ok((initiator.handle, token.into_bytes()))
    }

    async fn accept_offer(
        &self,
        _remote_id: &str,
        offer: &[u8],
    ) -> Result<(ChannelHandle, Vec<u8>), TransportError> {
        let token = String::from_utf8_lossy(offer).to_string();
        let pending = self
            .offers
            .lock()
            .await
            .remove(&token)
            .ok_or_else(|| TransportError::Signaling(format!("unknown offer {token}")))?;

        pending.open.store(true, Ordering::SeqCst);
        let _ = pending.responder.events_tx.send(ChannelEvent::Open).await;

        Ok((pending.responder.handle, token.into_bytes()))
    }

    async fn apply_answer(&self, _remote_id: &str, answer: &[u8]) -> Result<(), TransportError> {
        let token = String::from_utf8_lossy(answer).to_string();
        let pending = self
            .answers
            .lock()
            .await
            .remove(&token)
            .ok_or_else(|| TransportError::Signaling(format!("unknown answer {token}")))?;

        let _ = pending.initiator_events_tx.send(ChannelEvent::Open).await;
        Ok(())
    }

    async fn apply_candidate(
        &self,
        _remote_id: &str,
        _candidate: &[u8],
    ) -> Result<(), TransportError> {
        // No trickle phase for in-memory pipes.
        Ok(())
    }
}
