// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Relay Core Configuration
//!
//! Tunables for command dispatch and the P2P transport. Everything has a
//! conservative default; applications typically override only `p2p_mode`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport selection policy for outgoing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum P2pMode {
    /// Never attempt P2P; always relay through the Hub.
    HubOnly,
    /// Prefer an authenticated P2P session, fall back to the Hub.
    Auto,
    /// P2P only; no Hub fallback. Dispatch fails with `NoRoute` when no
    /// authenticated session exists.
    DirectOnly,
}

impl Default for P2pMode {
    fn default() -> Self {
        P2pMode::HubOnly
    }
}

/// Configuration for the relay core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport selection policy.
    pub p2p_mode: P2pMode,

    /// Default deadline for a command round trip.
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// How long P2P message nonces are remembered for replay rejection.
    #[serde(with = "duration_secs")]
    pub nonce_window: Duration,

    /// Cap on remembered nonces; bounds memory under flood.
    pub max_nonce_entries: usize,

    /// Acceptance window for inbound command timestamps (node side).
    #[serde(with = "duration_secs")]
    pub replay_window: Duration,

    /// Bound on concurrently processed inbound connection offers.
    pub max_concurrent_handshakes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            p2p_mode: P2pMode::default(),
            command_timeout: Duration::from_secs(25),
            nonce_window: Duration::from_secs(300),
            max_nonce_entries: 10_000,
            replay_window: Duration::from_secs(60),
            max_concurrent_handshakes: 10,
        }
    }
}

impl Config {
    /// Parse a config from TOML, filling unset fields with defaults.
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(input)?)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
