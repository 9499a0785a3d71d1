// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Command Wire Types
//!
//! The layered payload every command goes through, regardless of
//! transport:
//!
//! ```text
//! InnerCommand (type + payload)
//!   └─ SecureCommandPayload (request_id + timestamp, anti-replay)
//!        └─ EncryptedEnvelope (sealed + signed)
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::crypto::error::CryptoError;
use crate::crypto::wipe::generate_random_bytes;

/// Command kinds understood by nodes. The payload schema of each kind is
/// owned by the node application layer; this core treats it as bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Ping,
    Status,
    ListProxies,
    CreateProxy,
    DeleteProxy,
    ListRules,
    UpdateRule,
}

/// The application-level command, marshalled into the secure payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerCommand {
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Anti-replay wrapper around a marshalled [`InnerCommand`].
///
/// `request_id` is accepted at most once by the receiving node within the
/// validity window; `timestamp` bounds that window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureCommandPayload {
    /// 128-bit random request ID, hex encoded.
    pub request_id: String,
    /// Unix seconds at send time.
    pub timestamp: i64,
    /// Marshalled [`InnerCommand`].
    pub data: Vec<u8>,
}

impl SecureCommandPayload {
    /// Wrap marshalled command bytes with a given request ID and the
    /// current timestamp.
    pub fn new(request_id: String, data: Vec<u8>) -> Self {
        Self {
            request_id,
            timestamp: Utc::now().timestamp(),
            data,
        }
    }
}

/// Result of a command as reported by the node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    /// "OK" on success; anything else is an error status.
    pub status: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub response_payload: Vec<u8>,
}

impl CommandResult {
    /// Successful result carrying a response payload.
    pub fn ok(response_payload: Vec<u8>) -> Self {
        Self {
            status: "OK".to_string(),
            error_message: String::new(),
            response_payload,
        }
    }

    /// Error result with a message for the caller.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "ERROR".to_string(),
            error_message: message.into(),
            response_payload: Vec::new(),
        }
    }

    /// Whether the node reported success.
    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }
}

/// Generate a fresh 128-bit request ID, hex encoded.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the system RNG fails; the
/// command must not be sent with a predictable ID.
pub fn new_request_id() -> Result<String, CryptoError> {
    Ok(hex::encode(generate_random_bytes(16)?))
}
