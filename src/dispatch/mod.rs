// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Command Dispatch
//!
//! The unified pipeline for end-to-end encrypted commands. The controller
//! side ([`Dispatcher`]) wraps, encrypts, signs, and picks a transport;
//! the node side ([`CommandReceiver`]) verifies, decrypts, enforces
//! anti-replay, and replies in kind. The same envelope construction runs
//! over every transport; the transport only changes how opaque bytes get
//! to the other end.

pub mod dispatcher;
pub mod error;
pub mod receiver;
pub mod replay;
pub mod types;

pub use dispatcher::{DirectConnection, Dispatcher};
pub use error::DispatchError;
pub use receiver::{CommandHandlerFn, CommandReceiver};
pub use replay::ReplayGuard;
pub use types::{
    new_request_id, CommandResult, CommandType, InnerCommand, SecureCommandPayload,
};
