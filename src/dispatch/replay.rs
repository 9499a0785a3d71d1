// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Request-ID Replay Guard
//!
//! Node-side validation of inbound `SecureCommandPayload`s: a request ID
//! is accepted at most once inside the validity window, stale or
//! far-future timestamps are rejected, and (optionally) the sender
//! fingerprint must match the paired controller. A background sweep keeps
//! the seen-set from growing unboundedly; entries are retained for twice
//! the window as a safety margin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dispatch::error::DispatchError;

/// Allowance for senders whose clock runs ahead of ours.
const FUTURE_SKEW: Duration = Duration::from_secs(30);

/// Interval of the background sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Tracks seen request IDs to reject replayed commands.
pub struct ReplayGuard {
    seen: Arc<Mutex<HashMap<String, Instant>>>,
    window: Duration,
    trusted_fingerprint: RwLock<Option<String>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayGuard {
    /// Create a guard and start its background sweeper.
    ///
    /// Must be called within a Tokio runtime. `trusted_fingerprint`, when
    /// set, pins inbound commands to a single sender.
    pub fn new(window: Duration, trusted_fingerprint: Option<String>) -> Self {
        let seen: Arc<Mutex<HashMap<String, Instant>>> = Arc::new(Mutex::new(HashMap::new()));

        let sweeper_seen = seen.clone();
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let mut seen = sweeper_seen.lock().expect("replay guard poisoned");
                let before = seen.len();
                // Keep entries for 2x the window as a safety margin.
                seen.retain(|_, at| at.elapsed() < window * 2);
                let swept = before - seen.len();
                drop(seen);
                if swept > 0 {
                    debug!(swept, "replay guard sweep");
                }
            }
        });

        Self {
            seen,
            window,
            trusted_fingerprint: RwLock::new(trusted_fingerprint),
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Validate an inbound command:
    ///
    /// 1. the timestamp is inside the acceptance window (small future skew
    ///    allowed for clock drift)
    /// 2. the sender fingerprint matches the pinned one, if any
    /// 3. the request ID has not been seen before
    ///
    /// On success the request ID is recorded, so a second call with the
    /// same ID fails.
    pub fn validate(
        &self,
        request_id: &str,
        timestamp: i64,
        sender_fingerprint: &str,
    ) -> Result<(), DispatchError> {
        let now = Utc::now().timestamp();
        let age = now - timestamp;

        if age < 0 {
            if (-age) as u64 > FUTURE_SKEW.as_secs() {
                return Err(DispatchError::Replay(
                    "command timestamp is in the future".to_string(),
                ));
            }
        } else if age as u64 > self.window.as_secs() {
            return Err(DispatchError::Replay(format!(
                "command expired: older than {:?}",
                self.window
            )));
        }

        if let Some(trusted) = self
            .trusted_fingerprint
            .read()
            .expect("replay guard poisoned")
            .as_deref()
        {
            if sender_fingerprint != trusted {
                return Err(DispatchError::Replay(
                    "untrusted sender: fingerprint mismatch".to_string(),
                ));
            }
        }

        let mut seen = self.seen.lock().expect("replay guard poisoned");
        if seen.contains_key(request_id) {
            return Err(DispatchError::Replay(
                "duplicate request id".to_string(),
            ));
        }
        seen.insert(request_id.to_string(), Instant::now());
        Ok(())
    }

    /// Update the pinned sender fingerprint.
    pub fn set_trusted_fingerprint(&self, fingerprint: Option<String>) {
        *self
            .trusted_fingerprint
            .write()
            .expect("replay guard poisoned") = fingerprint;
    }

    /// Number of tracked request IDs (for monitoring).
    pub fn len(&self) -> usize {
        self.seen.lock().expect("replay guard poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background sweeper.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().expect("replay guard poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for ReplayGuard {
    fn drop(&mut self) {
        self.stop();
    }
}
