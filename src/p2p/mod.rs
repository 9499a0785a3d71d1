// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Peer-to-Peer Transport
//!
//! Direct controller↔node sessions that bypass the Hub once established.
//! The Hub still relays the signaling needed to set a channel up, but the
//! channel itself carries only handshake frames and encrypted messages:
//!
//! 1. Signaling (offer/answer/candidate) bootstraps a data channel via
//!    the pluggable [`channel::ChannelDriver`]
//! 2. A mutual challenge–response handshake authenticates both ends
//!    before any application traffic is accepted
//! 3. Every message after that is an encrypted envelope with nonce-based
//!    replay protection and request/response correlation

pub mod cert;
pub mod channel;
pub mod error;
pub mod memory;
pub mod messages;
pub mod nonce;
pub mod transport;

pub use cert::TrustRoot;
pub use channel::{ChannelDriver, ChannelEvent, ChannelHandle, DataChannel};
pub use error::TransportError;
pub use memory::MemoryNetwork;
pub use messages::{
    ApprovalAction, ApprovalDecision, ApprovalRequest, AuthMessage, CommandPayload,
    CommandResponse, MessageKind, P2pMessage,
};
pub use nonce::NonceLedger;
pub use transport::{SessionStage, Transport};
