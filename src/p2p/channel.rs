// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Data-Channel Abstraction
//!
//! The transport does not implement NAT traversal itself. ICE/STUN
//! negotiation and the actual data channel are delegated to a
//! WebRTC-style implementation behind [`ChannelDriver`]; this core owns
//! only the bytes that travel over the channel and the authentication of
//! the peer at the other end.
//!
//! Signaling payloads (offers, answers, candidates) are opaque to the
//! core: they are produced and consumed by the driver and relayed through
//! the Hub untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::p2p::error::TransportError;

/// Lifecycle and traffic events of one data channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The channel is open and ready to carry frames.
    Open,
    /// One inbound frame.
    Message(Vec<u8>),
    /// The channel closed or failed; no further events follow.
    Closed,
}

/// The send half of an established (or establishing) data channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Send one frame. Fails if the channel is not open.
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// A channel plus the stream of its events; what a driver hands back for
/// every connection attempt.
pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle").finish_non_exhaustive()
    }
}

/// Driver for the underlying NAT-traversal stack.
///
/// One driver instance serves all peers of a transport. The payload blobs
/// are whatever the driver's wire format needs (SDP, ICE candidates, ...);
/// the core never inspects them.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    /// Start an outbound connection attempt. Returns the local channel
    /// handle and the offer payload to relay to the peer.
    async fn create_offer(
        &self,
        remote_id: &str,
    ) -> Result<(ChannelHandle, Vec<u8>), TransportError>;

    /// Accept an inbound offer. Returns the local channel handle and the
    /// answer payload to relay back.
    async fn accept_offer(
        &self,
        remote_id: &str,
        offer: &[u8],
    ) -> Result<(ChannelHandle, Vec<u8>), TransportError>;

    /// Apply the answer for a previously created offer.
    async fn apply_answer(&self, remote_id: &str, answer: &[u8]) -> Result<(), TransportError>;

    /// Apply a trickled candidate for an in-progress connection.
    async fn apply_candidate(&self, remote_id: &str, candidate: &[u8])
        -> Result<(), TransportError>;
}
